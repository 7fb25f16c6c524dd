//! Capability traits of the storage layers.
//!
//! Each store layer implements the trait for its own abstraction and
//! re-implements the lower traits by delegating to the layer it wraps, so a
//! record store can still be used as a block store. The index layers above
//! the record store are generic over keys and codecs and therefore stay
//! plain structs; they follow the same create/mount/unmount discipline
//! through inherent methods.

use super::{
    controller::Device,
    error::APIError,
    types::{BlockHandle, Geometry},
};
use std::{error, path::Path};

/// General trait that each store layer implements, allowing stores to be
/// created, mounted on an existing device, and torn down.
/// Additionally defines the error type used by the other traits.
pub trait StoreSupport: Sized {
    /// The error type of this layer.
    type Error: error::Error;

    /// Static method to check whether the given geometry describes a valid
    /// store file for this layer.
    fn geometry_valid(geometry: &Geometry) -> bool;

    /// Create a new store file at `path` and mount it.
    /// Fails if the geometry is invalid or the path already exists.
    /// Layers perform their own initialization on top of the fresh device
    /// (e.g. the record layer materializes its free-list record).
    fn mkstore<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self, Self::Error>;

    /// Mount an existing device, after checking that its image is a valid
    /// store file: the geometry must be valid and the device length a whole
    /// number of blocks.
    fn mountstore(dev: Device, geometry: Geometry) -> Result<Self, Self::Error>;

    /// Unmount this store, consuming it and returning the device backing it.
    /// Cached dirty blocks are flushed back first.
    fn unmountstore(self) -> Device;
}

/// This trait adds block-level operations to a store layer.
pub trait BlockSupport: StoreSupport {
    /// Extend the file by exactly one zero-filled block and return a handle
    /// on it. The new block's id is the new last page index.
    /// Fails if the file length is not a multiple of the block size.
    fn b_new(&mut self) -> Result<BlockHandle, Self::Error>;

    /// Look up the block with page index `i`.
    /// Returns `None` if the block lies past the end of the file.
    /// While a previously found block is still live, the same handle is
    /// returned from the cache.
    fn b_find(&mut self, i: u32) -> Result<Option<BlockHandle>, Self::Error>;

    /// Read `n` content bytes of `block` starting at `src_off` into `dst` at
    /// `dst_off`.
    fn b_read(
        &self,
        block: &BlockHandle,
        dst: &mut [u8],
        dst_off: usize,
        src_off: usize,
        n: usize,
    ) -> Result<(), Self::Error>;

    /// Write `n` bytes from `src` at `src_off` into the content of `block`
    /// at `dst_off`.
    fn b_write(
        &mut self,
        block: &BlockHandle,
        src: &[u8],
        src_off: usize,
        dst_off: usize,
        n: usize,
    ) -> Result<(), Self::Error>;

    /// Release `block`: flush its buffered sector if dirty and evict it from
    /// the cache. Releasing a block twice is a no-op; any other use of a
    /// released block fails.
    fn b_release(&mut self, block: BlockHandle) -> Result<(), Self::Error>;

    /// The geometry of the backing store file.
    fn geometry(&self) -> Geometry;
}

/// This trait adds the abstraction of records (chains of blocks holding one
/// variable-length payload each) to a store layer.
pub trait RecordSupport: BlockSupport {
    /// Store `payload` as a new record and return its id (the id of the head
    /// block). Free blocks are reused before the file grows.
    fn r_create(&mut self, payload: &[u8]) -> Result<u32, Self::Error>;

    /// Like [`RecordSupport::r_create`], but the payload is produced by `gen`,
    /// which receives the id the new record will get. Used by callers that
    /// embed the record id inside the payload.
    fn r_create_with<F>(&mut self, gen: F) -> Result<u32, Self::Error>
    where
        F: FnOnce(u32) -> Result<Vec<u8>, APIError>;

    /// Read back the payload of record `i`.
    /// Returns `None` if the head block is missing, tombstoned, or not a
    /// chain head.
    fn r_find(&mut self, i: u32) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Replace the payload of record `i`, reusing its chain in order,
    /// growing it when the payload is longer and freeing surplus blocks when
    /// it is shorter. The record keeps its id.
    fn r_update(&mut self, i: u32, payload: &[u8]) -> Result<(), Self::Error>;

    /// Delete record `i`: tombstone every block of its chain and push their
    /// ids onto the free list.
    fn r_delete(&mut self, i: u32) -> Result<(), Self::Error>;
}
