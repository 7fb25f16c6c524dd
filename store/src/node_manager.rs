//! Lifetime and cache layer for tree nodes.
//!
//! The manager owns the record store backing one index file. Loaded nodes
//! are shared `Rc<RefCell<…>>` handles: a weak map keeps them discoverable
//! while any owner is alive, and a bounded strong FIFO keeps recently loaded
//! nodes from being dropped between operations. Mutated nodes are parked in
//! a dirty map until `save_changes` rewrites their records.
//!
//! Record id 1 pins the root: its 4-byte little-endian payload is the id of
//! the current root node. A fresh store materializes it together with an
//! empty root node at record id 2.

use bstore_api::codec::Codec;
use bstore_api::controller::Device;
use bstore_api::store::{RecordSupport, StoreSupport};
use bstore_api::types::{Geometry, NodeHandle, TreeNode};
use bstore_api::util;
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::rc::{Rc, Weak};

use super::error_store::TreeError;
use super::node_codec::NodeCodec;
use super::record_store::RecordStore;

/// Id of the record whose payload holds the current root node id.
pub const ROOT_POINTER_RECORD_ID: u32 = 1;

/// Default minimum number of entries per non-root node (the tree's T).
pub const DEFAULT_MIN_ENTRIES: usize = 36;

/// Capacity of the strong FIFO of recently loaded nodes.
const HOT_CACHE_CAPACITY: usize = 200;

/// Dead weak references are swept from the load map every this many inserts.
const TOMBSTONE_SWEEP_INTERVAL: u64 = 1000;

/// Cache and persistence layer for the nodes of one tree.
#[derive(Debug)]
pub struct NodeManager<K, V, KC, VC> {
    records: RecordStore,
    codec: NodeCodec<K, V, KC, VC>,
    min_entries: usize,
    root: Option<NodeHandle<K, V>>,
    loaded: HashMap<u32, Weak<RefCell<TreeNode<K, V>>>>,
    hot: VecDeque<NodeHandle<K, V>>,
    dirty: HashMap<u32, NodeHandle<K, V>>,
    loads: u64,
}

impl<K, V, KC, VC> NodeManager<K, V, KC, VC>
where
    K: Clone,
    V: Clone,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Create a fresh index file at `path` and pin an empty root in it.
    pub fn mkstore<P: AsRef<Path>>(
        path: P,
        geometry: Geometry,
        min_entries: usize,
    ) -> Result<Self, TreeError> {
        let records = RecordStore::mkstore(path, geometry)?;
        Self::with_records(records, min_entries)
    }

    /// Mount an existing index file and load its pinned root.
    pub fn mountstore(dev: Device, geometry: Geometry, min_entries: usize) -> Result<Self, TreeError> {
        let records = RecordStore::mountstore(dev, geometry)?;
        Self::with_records(records, min_entries)
    }

    /// Unmount the manager, returning the device of the backing file.
    /// Unsaved dirty nodes are discarded; call [`NodeManager::save_changes`] first.
    pub fn unmountstore(self) -> Device {
        self.records.unmountstore()
    }

    fn with_records(records: RecordStore, min_entries: usize) -> Result<Self, TreeError> {
        let mut manager = NodeManager {
            records,
            codec: NodeCodec::new()?,
            min_entries,
            root: None,
            loaded: HashMap::new(),
            hot: VecDeque::new(),
            dirty: HashMap::new(),
            loads: 0,
        };
        manager.pin_root()?;
        Ok(manager)
    }

    fn pin_root(&mut self) -> Result<(), TreeError> {
        match self.records.r_find(ROOT_POINTER_RECORD_ID)? {
            Some(payload) => {
                if payload.len() != 4 {
                    return Err(TreeError::Format(
                        "root pointer record must hold a 4-byte id",
                    ));
                }
                let root_id = util::read_u32(&payload, 0)?;
                let root = self
                    .load(root_id)?
                    .ok_or(TreeError::Format("root node record is missing"))?;
                self.root = Some(root);
            }
            None => {
                let pointer = self.records.r_create(&[0, 0, 0, 0])?;
                if pointer != ROOT_POINTER_RECORD_ID {
                    return Err(TreeError::Format("root pointer record must be record 1"));
                }
                let root = self.create(Vec::new(), Vec::new())?;
                self.make_root(&root)?;
            }
        }
        Ok(())
    }

    /// Minimum number of entries per non-root node (T).
    pub fn min_entries(&self) -> usize {
        self.min_entries
    }

    fn cache_node(&mut self, id: u32, node: NodeHandle<K, V>) {
        self.loaded.insert(id, Rc::downgrade(&node));
        self.hot.push_back(node);
        if self.hot.len() >= HOT_CACHE_CAPACITY {
            while self.hot.len() > HOT_CACHE_CAPACITY / 2 {
                self.hot.pop_front();
            }
        }
        self.loads += 1;
        if self.loads % TOMBSTONE_SWEEP_INTERVAL == 0 {
            self.loaded.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    fn load(&mut self, id: u32) -> Result<Option<NodeHandle<K, V>>, TreeError> {
        if let Some(weak) = self.loaded.get(&id) {
            if let Some(node) = weak.upgrade() {
                return Ok(Some(node));
            }
        }
        match self.records.r_find(id)? {
            None => Ok(None),
            Some(payload) => {
                let node = Rc::new(RefCell::new(self.codec.decode(id, &payload)?));
                self.cache_node(id, node.clone());
                Ok(Some(node))
            }
        }
    }

    /// Look up the node stored in record `id`.
    pub fn find(&mut self, id: u32) -> Result<Option<NodeHandle<K, V>>, TreeError> {
        if let Some(root) = &self.root {
            if root.borrow().id == id {
                return Ok(Some(root.clone()));
            }
        }
        self.load(id)
    }

    /// The current root node, repinned from record 1 when necessary.
    pub fn root_node(&mut self) -> Result<NodeHandle<K, V>, TreeError> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let payload = self
            .records
            .r_find(ROOT_POINTER_RECORD_ID)?
            .ok_or(TreeError::Format("root pointer record is missing"))?;
        if payload.len() != 4 {
            return Err(TreeError::Format(
                "root pointer record must hold a 4-byte id",
            ));
        }
        let root_id = util::read_u32(&payload, 0)?;
        let root = self
            .load(root_id)?
            .ok_or(TreeError::Format("root node record is missing"))?;
        self.root = Some(root.clone());
        Ok(root)
    }

    /// Store a new node with the given entries and children.
    /// The node learns its id from the record allocator.
    pub fn create(
        &mut self,
        entries: Vec<(K, V)>,
        children: Vec<u32>,
    ) -> Result<NodeHandle<K, V>, TreeError> {
        let mut node = TreeNode::new(0, 0, entries, children);
        let codec = &self.codec;
        let id = self.records.r_create_with(|record_id| {
            node.id = record_id;
            codec.encode(&node)
        })?;
        let handle = Rc::new(RefCell::new(node));
        self.cache_node(id, handle.clone());
        Ok(handle)
    }

    /// Park `node` for the next [`NodeManager::save_changes`].
    pub fn mark_as_changed(&mut self, node: &NodeHandle<K, V>) {
        let id = node.borrow().id;
        self.dirty.insert(id, node.clone());
    }

    /// Rewrite every dirty node's record and clear the dirty set.
    pub fn save_changes(&mut self) -> Result<(), TreeError> {
        let parked: Vec<(u32, NodeHandle<K, V>)> = self.dirty.drain().collect();
        if !parked.is_empty() {
            debug!("saving {} dirty nodes", parked.len());
        }
        for (id, node) in parked {
            let payload = self.codec.encode(&node.borrow())?;
            self.records.r_update(id, &payload)?;
        }
        Ok(())
    }

    /// Delete `node`'s record and drop it from all caches.
    /// Deleting the pinned root empties the root slot; the next
    /// [`NodeManager::make_root`] or root lookup repins it.
    pub fn delete(&mut self, node: &NodeHandle<K, V>) -> Result<(), TreeError> {
        let id = node.borrow().id;
        self.records.r_delete(id)?;
        self.dirty.remove(&id);
        self.loaded.remove(&id);
        self.hot.retain(|n| n.borrow().id != id);
        if let Some(root) = &self.root {
            if root.borrow().id == id {
                self.root = None;
            }
        }
        Ok(())
    }

    /// Make `node` the root: clear its parent link and rewrite the root
    /// pointer record with its id.
    pub fn make_root(&mut self, node: &NodeHandle<K, V>) -> Result<(), TreeError> {
        let id = {
            let mut n = node.borrow_mut();
            n.parent_id = 0;
            n.id
        };
        let mut payload = [0u8; 4];
        util::write_u32(&mut payload, 0, id)?;
        self.records.r_update(ROOT_POINTER_RECORD_ID, &payload)?;
        self.root = Some(node.clone());
        debug!("pinned node {} as root", id);
        Ok(())
    }

    /// Grow the tree by one level: a new root holding a single separator
    /// entry over the children `left` and `right`.
    pub fn create_new_root(
        &mut self,
        key: K,
        value: V,
        left: u32,
        right: u32,
    ) -> Result<NodeHandle<K, V>, TreeError> {
        let root = self.create(vec![(key, value)], vec![left, right])?;
        self.make_root(&root)?;
        Ok(root)
    }
}
