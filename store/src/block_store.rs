//! Store layer with block support.
//!
//! A store file is a sequence of fixed-size blocks, identified by their
//! zero-based page index. Blocks are appended by extending the file, looked
//! up on demand, and kept in an instance-private cache while in use; the
//! buffered first sector of each block is written through to the device when
//! the block is released.

use bstore_api::controller::Device;
use bstore_api::store::{BlockSupport, StoreSupport};
use bstore_api::types::{Block, BlockHandle, Buffer, Geometry};
use log::trace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use super::error_store::BlockError;

/// Name of the store type implementing the block layer.
pub type StoreName = BlockStore;

/// Struct representing the block layer
#[derive(Debug)]
pub struct BlockStore {
    /// the encapsulated device
    device: Device,
    /// block and header sizes of this store file
    geometry: Geometry,
    /// live blocks by id; entries are evicted on release
    cache: HashMap<u32, BlockHandle>,
}

impl StoreSupport for BlockStore {
    type Error = BlockError;

    fn geometry_valid(geometry: &Geometry) -> bool {
        geometry.is_valid()
    }

    fn mkstore<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(&geometry) {
            return Err(BlockError::Input("invalid store geometry"));
        }
        let device = Device::new(path)?;
        Ok(BlockStore {
            device,
            geometry,
            cache: HashMap::new(),
        })
    }

    fn mountstore(dev: Device, geometry: Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(&geometry) {
            return Err(BlockError::Input("invalid store geometry"));
        }
        if dev.len() % geometry.block_size as u64 != 0 {
            return Err(BlockError::Format(
                "file length is not a multiple of the block size",
            ));
        }
        Ok(BlockStore {
            device: dev,
            geometry,
            cache: HashMap::new(),
        })
    }

    fn unmountstore(mut self) -> Device {
        for (_, block) in self.cache.drain() {
            if let Err(e) = block.borrow_mut().release(&mut self.device) {
                log::error!("failed to flush block on unmount: {}", e);
            }
        }
        self.device
    }
}

impl BlockSupport for BlockStore {
    fn b_new(&mut self) -> Result<BlockHandle, Self::Error> {
        let bs = self.geometry.block_size as u64;
        let len = self.device.len();
        if len % bs != 0 {
            return Err(BlockError::Format(
                "file length is not a multiple of the block size",
            ));
        }
        let id = (len / bs) as u32;
        self.device.extend_by(bs)?;
        let sector = Buffer::new_zero(self.geometry.sector_size() as u64);
        let block = Rc::new(RefCell::new(Block::new(id, self.geometry, sector)?));
        self.cache.insert(id, block.clone());
        trace!("appended block {}", id);
        Ok(block)
    }

    fn b_find(&mut self, i: u32) -> Result<Option<BlockHandle>, Self::Error> {
        let bs = self.geometry.block_size as u64;
        if (i as u64 + 1) * bs > self.device.len() {
            return Ok(None);
        }
        if let Some(block) = self.cache.get(&i) {
            return Ok(Some(block.clone()));
        }
        let mut sector = Buffer::new_zero(self.geometry.sector_size() as u64);
        self.device.read_into(i as u64 * bs, sector.contents_as_mut())?;
        let block = Rc::new(RefCell::new(Block::new(i, self.geometry, sector)?));
        self.cache.insert(i, block.clone());
        Ok(Some(block))
    }

    fn b_read(
        &self,
        block: &BlockHandle,
        dst: &mut [u8],
        dst_off: usize,
        src_off: usize,
        n: usize,
    ) -> Result<(), Self::Error> {
        block
            .borrow()
            .read_content(&self.device, dst, dst_off, src_off, n)?;
        Ok(())
    }

    fn b_write(
        &mut self,
        block: &BlockHandle,
        src: &[u8],
        src_off: usize,
        dst_off: usize,
        n: usize,
    ) -> Result<(), Self::Error> {
        block
            .borrow_mut()
            .write_content(&mut self.device, src, src_off, dst_off, n)?;
        Ok(())
    }

    fn b_release(&mut self, block: BlockHandle) -> Result<(), Self::Error> {
        let id = {
            let mut b = block.borrow_mut();
            if b.is_released() {
                return Ok(());
            }
            b.release(&mut self.device)?;
            b.id()
        };
        self.cache.remove(&id);
        Ok(())
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }
}

// The scenario tests for this layer are shared through the api crate, so
// they can exercise any store type that implements the block traits.
#[cfg(all(test, any(feature = "block", feature = "all")))]
#[path = "../../api/store-tests/block_test.rs"]
mod tests;
