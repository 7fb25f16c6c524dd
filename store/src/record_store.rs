//! Store layer with record support.
//!
//! A record is one variable-length payload spread over a chain of blocks
//! linked through their reserved header fields; the record id is the id of
//! the head block. Record id 0 is the free-block record: its content is a
//! LIFO stack of little-endian block ids, four bytes per entry, appended to
//! the last block of its own chain. The allocator pops that stack before it
//! grows the file.

use bstore_api::controller::Device;
use bstore_api::error::APIError;
use bstore_api::store::{BlockSupport, RecordSupport, StoreSupport};
use bstore_api::types::{
    BlockHandle, Geometry, BLOCK_CONTENT_LENGTH, IS_DELETED, MAX_RECORD_SIZE, NEXT_BLOCK_ID,
    PREVIOUS_BLOCK_ID, RECORD_LENGTH, RESERVED_HEADER_FIELDS,
};
use bstore_api::util;
use log::{debug, trace};
use std::convert::TryFrom;
use std::path::Path;

use super::block_store::BlockStore;
use super::error_store::RecordError;

/// Id of the free-block record.
pub const FREE_LIST_RECORD_ID: u32 = 0;

/// Name of the store type implementing the record layer.
pub type StoreName = RecordStore;

///Struct representing a store with up to record layer support
#[derive(Debug)]
pub struct RecordStore {
    blocks: BlockStore,
}

/// Read a header field that holds a block id or length, rejecting negatives.
fn header_u32(block: &BlockHandle, field: usize) -> Result<u32, RecordError> {
    let v = block.borrow_mut().get_header(field)?;
    u32::try_from(v).map_err(|_| RecordError::Format("negative value in a block header field"))
}

fn set_header(block: &BlockHandle, field: usize, v: i64) -> Result<(), RecordError> {
    block.borrow_mut().set_header(field, v)?;
    Ok(())
}

fn block_id(block: &BlockHandle) -> u32 {
    block.borrow().id()
}

impl RecordStore {
    /// Upper bound on the number of blocks any well-formed chain can have,
    /// used as a cycle guard while walking.
    fn max_chain_blocks(&self) -> usize {
        (MAX_RECORD_SIZE / self.geometry().content_size() as u64) as usize + 2
    }

    ///Collect the chain of record `i`, head first.
    ///Fails when `i` does not address a live record head or the chain is malformed.
    fn find_blocks(&mut self, i: u32) -> Result<Vec<BlockHandle>, RecordError> {
        let head = self
            .b_find(i)?
            .ok_or(RecordError::Input("record not found"))?;
        if header_u32(&head, IS_DELETED)? == 1 {
            return Err(RecordError::Input("record is deleted"));
        }
        if header_u32(&head, PREVIOUS_BLOCK_ID)? != 0 {
            return Err(RecordError::Input("id does not address a record head"));
        }
        let limit = self.max_chain_blocks();
        let mut chain = vec![head];
        loop {
            let next = match chain.last() {
                Some(last) => header_u32(last, NEXT_BLOCK_ID)?,
                None => break,
            };
            if next == 0 {
                break;
            }
            let block = self
                .b_find(next)?
                .ok_or(RecordError::Format("missing block in record chain"))?;
            if header_u32(&block, IS_DELETED)? == 1 {
                return Err(RecordError::Format("deleted block in record chain"));
            }
            chain.push(block);
            if chain.len() > limit {
                return Err(RecordError::Format("record chain exceeds the maximum record size"));
            }
        }
        Ok(chain)
    }

    fn release_all(&mut self, chain: Vec<BlockHandle>) -> Result<(), RecordError> {
        for block in chain {
            self.b_release(block)?;
        }
        Ok(())
    }

    ///Pop a reusable block id off the free-block record, if one is available.
    ///
    ///When the last block of the free chain still holds ids, the trailing id
    ///is popped in place. When it is empty but has a predecessor, the
    ///predecessor's trailing id is handed out, the emptied tail is detached
    ///from the chain, and its own id takes over the vacated slot.
    fn try_find_free_block(&mut self) -> Result<Option<u32>, RecordError> {
        let chain = self.find_blocks(FREE_LIST_RECORD_ID)?;
        let last = chain[chain.len() - 1].clone();
        let last_len = header_u32(&last, BLOCK_CONTENT_LENGTH)?;
        if last_len % 4 != 0 {
            return Err(RecordError::Format(
                "free list content length is not 4-byte aligned",
            ));
        }

        if last_len > 0 {
            let mut id_bytes = [0u8; 4];
            self.b_read(&last, &mut id_bytes, 0, (last_len - 4) as usize, 4)?;
            let id = util::read_u32(&id_bytes, 0)?;
            set_header(&last, BLOCK_CONTENT_LENGTH, (last_len - 4) as i64)?;
            self.release_all(chain)?;
            return Ok(Some(id));
        }

        if chain.len() >= 2 {
            let prev = chain[chain.len() - 2].clone();
            let prev_len = header_u32(&prev, BLOCK_CONTENT_LENGTH)?;
            if prev_len % 4 != 0 || prev_len == 0 {
                return Err(RecordError::Format(
                    "free list content length is not 4-byte aligned",
                ));
            }
            let slot = (prev_len - 4) as usize;
            let mut id_bytes = [0u8; 4];
            self.b_read(&prev, &mut id_bytes, 0, slot, 4)?;
            let id = util::read_u32(&id_bytes, 0)?;
            // The emptied tail leaves the chain; its own id becomes the next
            // free candidate in the slot just vacated.
            let tail_id = block_id(&last);
            self.b_write(&prev, &util::u32_bytes(tail_id), 0, slot, 4)?;
            set_header(&prev, NEXT_BLOCK_ID, 0)?;
            set_header(&last, PREVIOUS_BLOCK_ID, 0)?;
            self.release_all(chain)?;
            return Ok(Some(id));
        }

        self.release_all(chain)?;
        Ok(None)
    }

    ///Push `freed` onto the free-block record.
    ///Appends in place when the last block of the free chain has room, else
    ///grows the chain with a fresh tail block.
    fn mark_as_free(&mut self, freed: u32) -> Result<(), RecordError> {
        let chain = self.find_blocks(FREE_LIST_RECORD_ID)?;
        let last = chain[chain.len() - 1].clone();
        let last_len = header_u32(&last, BLOCK_CONTENT_LENGTH)?;
        if last_len % 4 != 0 {
            return Err(RecordError::Format(
                "free list content length is not 4-byte aligned",
            ));
        }
        if last_len + 4 <= self.geometry().content_size() {
            self.b_write(&last, &util::u32_bytes(freed), 0, last_len as usize, 4)?;
            set_header(&last, BLOCK_CONTENT_LENGTH, (last_len + 4) as i64)?;
        } else {
            // The new tail must come from the end of the file; popping the
            // free list from inside a push would recurse into itself.
            let tail = self.b_new()?;
            set_header(&tail, PREVIOUS_BLOCK_ID, block_id(&last) as i64)?;
            set_header(&last, NEXT_BLOCK_ID, block_id(&tail) as i64)?;
            self.b_write(&tail, &util::u32_bytes(freed), 0, 0, 4)?;
            set_header(&tail, BLOCK_CONTENT_LENGTH, 4)?;
            self.b_release(tail)?;
        }
        self.release_all(chain)?;
        trace!("pushed block {} onto the free list", freed);
        Ok(())
    }

    ///Hand out a block for record storage: a reused free block with its
    ///reserved header fields cleared, or a fresh one at the end of the file.
    fn allocate_block(&mut self) -> Result<BlockHandle, RecordError> {
        if let Some(id) = self.try_find_free_block()? {
            trace!("reusing free block {}", id);
            let block = self
                .b_find(id)?
                .ok_or(RecordError::Format("free list refers to a missing block"))?;
            for field in 0..RESERVED_HEADER_FIELDS {
                set_header(&block, field, 0)?;
            }
            return Ok(block);
        }
        Ok(self.b_new()?)
    }

    ///Write `payload` over the chain starting at `head`, allocating further
    ///blocks as needed. All touched blocks are released.
    fn write_chain(&mut self, head: BlockHandle, payload: &[u8]) -> Result<(), RecordError> {
        let content = self.geometry().content_size() as usize;
        set_header(&head, RECORD_LENGTH, payload.len() as i64)?;
        let mut current = head;
        let mut off = 0;
        loop {
            let n = usize::min(content, payload.len() - off);
            if n > 0 {
                self.b_write(&current, payload, off, 0, n)?;
            }
            set_header(&current, BLOCK_CONTENT_LENGTH, n as i64)?;
            off += n;
            if off >= payload.len() {
                set_header(&current, NEXT_BLOCK_ID, 0)?;
                self.b_release(current)?;
                break;
            }
            let next = self.allocate_block()?;
            set_header(&next, PREVIOUS_BLOCK_ID, block_id(&current) as i64)?;
            set_header(&current, NEXT_BLOCK_ID, block_id(&next) as i64)?;
            self.b_release(current)?;
            current = next;
        }
        Ok(())
    }
}

impl StoreSupport for RecordStore {
    type Error = RecordError;

    fn geometry_valid(geometry: &Geometry) -> bool {
        BlockStore::geometry_valid(geometry)
    }

    fn mkstore<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self, Self::Error> {
        let blocks = BlockStore::mkstore(path, geometry)?;
        let mut store = RecordStore { blocks };
        // Materialize the free-block record: a single empty head at page 0.
        let head = store.b_new()?;
        if block_id(&head) != FREE_LIST_RECORD_ID {
            return Err(RecordError::Format("fresh store file is not empty"));
        }
        store.b_release(head)?;
        Ok(store)
    }

    fn mountstore(dev: Device, geometry: Geometry) -> Result<Self, Self::Error> {
        if dev.len() < geometry.block_size as u64 {
            return Err(RecordError::Format(
                "store file is missing the free-block record",
            ));
        }
        let blocks = BlockStore::mountstore(dev, geometry)?;
        Ok(RecordStore { blocks })
    }

    fn unmountstore(self) -> Device {
        self.blocks.unmountstore()
    }
}

impl BlockSupport for RecordStore {
    fn b_new(&mut self) -> Result<BlockHandle, Self::Error> {
        Ok(self.blocks.b_new()?)
    }

    fn b_find(&mut self, i: u32) -> Result<Option<BlockHandle>, Self::Error> {
        Ok(self.blocks.b_find(i)?)
    }

    fn b_read(
        &self,
        block: &BlockHandle,
        dst: &mut [u8],
        dst_off: usize,
        src_off: usize,
        n: usize,
    ) -> Result<(), Self::Error> {
        Ok(self.blocks.b_read(block, dst, dst_off, src_off, n)?)
    }

    fn b_write(
        &mut self,
        block: &BlockHandle,
        src: &[u8],
        src_off: usize,
        dst_off: usize,
        n: usize,
    ) -> Result<(), Self::Error> {
        Ok(self.blocks.b_write(block, src, src_off, dst_off, n)?)
    }

    fn b_release(&mut self, block: BlockHandle) -> Result<(), Self::Error> {
        Ok(self.blocks.b_release(block)?)
    }

    fn geometry(&self) -> Geometry {
        self.blocks.geometry()
    }
}

impl RecordSupport for RecordStore {
    fn r_create(&mut self, payload: &[u8]) -> Result<u32, Self::Error> {
        let owned = payload.to_vec();
        self.r_create_with(move |_| Ok(owned))
    }

    fn r_create_with<F>(&mut self, gen: F) -> Result<u32, Self::Error>
    where
        F: FnOnce(u32) -> Result<Vec<u8>, APIError>,
    {
        let head = self.allocate_block()?;
        let head_id = block_id(&head);
        let payload = match gen(head_id) {
            Ok(p) => p,
            Err(e) => {
                // Return the freshly claimed head before bailing out.
                set_header(&head, IS_DELETED, 1)?;
                self.b_release(head)?;
                self.mark_as_free(head_id)?;
                return Err(RecordError::Payload(e));
            }
        };
        if payload.len() as u64 > MAX_RECORD_SIZE {
            set_header(&head, IS_DELETED, 1)?;
            self.b_release(head)?;
            self.mark_as_free(head_id)?;
            return Err(RecordError::Input(
                "record payload exceeds the maximum record size",
            ));
        }
        self.write_chain(head, &payload)?;
        debug!("created record {} ({} bytes)", head_id, payload.len());
        Ok(head_id)
    }

    fn r_find(&mut self, i: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        let head = match self.b_find(i)? {
            None => return Ok(None),
            Some(b) => b,
        };
        if header_u32(&head, IS_DELETED)? == 1 || header_u32(&head, PREVIOUS_BLOCK_ID)? != 0 {
            self.b_release(head)?;
            return Ok(None);
        }
        let record_len = header_u32(&head, RECORD_LENGTH)? as u64;
        if record_len > MAX_RECORD_SIZE {
            self.b_release(head)?;
            return Err(RecordError::Format(
                "record length exceeds the maximum record size",
            ));
        }
        let content = self.geometry().content_size();
        let mut payload = vec![0u8; record_len as usize];
        let mut copied = 0usize;
        let mut current = head;
        loop {
            let content_len = header_u32(&current, BLOCK_CONTENT_LENGTH)?;
            if content_len > content {
                return Err(RecordError::Format(
                    "block content length exceeds the content capacity",
                ));
            }
            let n = content_len as usize;
            if copied + n > payload.len() {
                return Err(RecordError::Format("record chain longer than its length"));
            }
            if n > 0 {
                self.b_read(&current, &mut payload, copied, 0, n)?;
            }
            copied += n;
            let next = header_u32(&current, NEXT_BLOCK_ID)?;
            self.b_release(current)?;
            if next == 0 {
                break;
            }
            let block = self
                .b_find(next)?
                .ok_or(RecordError::Format("missing block in record chain"))?;
            if header_u32(&block, IS_DELETED)? == 1 {
                return Err(RecordError::Format("deleted block in record chain"));
            }
            current = block;
        }
        if copied != payload.len() {
            return Err(RecordError::Format("record chain shorter than its length"));
        }
        Ok(Some(payload))
    }

    fn r_update(&mut self, i: u32, payload: &[u8]) -> Result<(), Self::Error> {
        if payload.len() as u64 > MAX_RECORD_SIZE {
            return Err(RecordError::Input(
                "record payload exceeds the maximum record size",
            ));
        }
        let old = self.find_blocks(i)?;
        let content = self.geometry().content_size() as usize;
        let needed = if payload.is_empty() {
            1
        } else {
            (payload.len() + content - 1) / content
        };

        let reuse = usize::min(needed, old.len());
        let mut used: Vec<BlockHandle> = old[..reuse].to_vec();
        while used.len() < needed {
            used.push(self.allocate_block()?);
        }
        let used_ids: Vec<u32> = used.iter().map(block_id).collect();

        for (idx, block) in used.iter().enumerate() {
            let off = idx * content;
            let n = usize::min(content, payload.len().saturating_sub(off));
            if n > 0 {
                self.b_write(block, payload, off, 0, n)?;
            }
            set_header(block, BLOCK_CONTENT_LENGTH, n as i64)?;
            let next = if idx + 1 < needed { used_ids[idx + 1] } else { 0 };
            set_header(block, NEXT_BLOCK_ID, next as i64)?;
            let prev = if idx == 0 { 0 } else { used_ids[idx - 1] };
            set_header(block, PREVIOUS_BLOCK_ID, prev as i64)?;
        }
        set_header(&used[0], RECORD_LENGTH, payload.len() as i64)?;
        for block in used {
            self.b_release(block)?;
        }

        // Surplus blocks of the old chain go back to the free list.
        let mut freed = Vec::new();
        for block in &old[reuse..] {
            set_header(block, IS_DELETED, 1)?;
            freed.push(block_id(block));
            self.b_release(block.clone())?;
        }
        for id in freed {
            self.mark_as_free(id)?;
        }
        debug!("updated record {} ({} bytes)", i, payload.len());
        Ok(())
    }

    fn r_delete(&mut self, i: u32) -> Result<(), Self::Error> {
        if i == FREE_LIST_RECORD_ID {
            return Err(RecordError::Input("the free-block record cannot be deleted"));
        }
        let chain = self.find_blocks(i)?;
        let mut ids = Vec::with_capacity(chain.len());
        for block in chain {
            set_header(&block, IS_DELETED, 1)?;
            ids.push(block_id(&block));
            self.b_release(block)?;
        }
        let nblocks = ids.len();
        for id in ids {
            self.mark_as_free(id)?;
        }
        debug!("deleted record {} ({} blocks)", i, nblocks);
        Ok(())
    }
}

// The scenario tests for this layer are shared through the api crate.
#[cfg(all(test, any(feature = "record", feature = "all")))]
#[path = "../../api/store-tests/record_test.rs"]
mod tests;
