use super::StoreName;
use bstore_api::controller::Device;
use bstore_api::store::{RecordSupport, StoreSupport};
use bstore_api::types::Geometry;
use std::path::PathBuf;

#[path = "utils.rs"]
mod utils;

//With 128-byte blocks and 48-byte headers every block carries 80 content
//bytes, so chains stay short and the free list fills up quickly
static GEOMETRY: Geometry = Geometry {
    block_size: 128,
    header_size: 48,
};
const BS: u64 = 128;

fn disk_prep_path(name: &str) -> PathBuf {
    utils::disk_prep_path(&("store-images-record-".to_string() + name), "img")
}

fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

#[test]
fn create_find_roundtrip() {
    let path = disk_prep_path("roundtrip");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    //Block 0 belongs to the free-block record, so the first record gets id 1
    let a = store.r_create(&[0xAA, 0xBB]).unwrap();
    assert_eq!(a, 1);
    let b = store.r_create(&payload(500)).unwrap();
    assert_eq!(store.r_find(a).unwrap().unwrap(), vec![0xAA, 0xBB]);
    assert_eq!(store.r_find(b).unwrap().unwrap(), payload(500));

    //Zero-length records occupy a single empty head block
    let c = store.r_create(&[]).unwrap();
    assert_eq!(store.r_find(c).unwrap().unwrap(), Vec::<u8>::new());

    //Blocks past the end, and ids that are not chain heads, are not records
    assert!(store.r_find(1000).unwrap().is_none());
    assert!(store.r_find(b + 1).unwrap().is_none()); //second block of b's chain

    //The payloads survive a remount
    let dev = store.unmountstore();
    drop(dev);
    let mut store = StoreName::mountstore(Device::load(&path).unwrap(), GEOMETRY).unwrap();
    assert_eq!(store.r_find(a).unwrap().unwrap(), vec![0xAA, 0xBB]);
    assert_eq!(store.r_find(b).unwrap().unwrap(), payload(500));

    utils::disk_destruct(store.unmountstore());
}

#[test]
fn chain_shape_and_lifo_reuse() {
    let path = disk_prep_path("lifo");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    //1000 bytes over 80-byte content blocks: a 13-block chain
    let data = payload(1000);
    let id = store.r_create(&data).unwrap();
    assert_eq!(id, 1);
    assert_eq!(store.r_find(id).unwrap().unwrap(), data);
    let dev = store.unmountstore();
    assert_eq!(dev.len(), 14 * BS); //free-list head + 13 chain blocks
    let mut store = StoreName::mountstore(dev, GEOMETRY).unwrap();

    //Deleting pushes the 13 ids; recreating pops them back, tail first,
    //without growing the file
    store.r_delete(id).unwrap();
    assert!(store.r_find(id).unwrap().is_none());
    let id2 = store.r_create(&data).unwrap();
    assert_eq!(id2, 13); //the most recently freed block becomes the new head
    assert_eq!(store.r_find(id2).unwrap().unwrap(), data);
    let dev = store.unmountstore();
    assert_eq!(dev.len(), 14 * BS);

    utils::disk_destruct(dev);
}

#[test]
fn update_shrink_and_grow() {
    let path = disk_prep_path("update");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    let id = store.r_create(&payload(1000)).unwrap();

    //Shrinking keeps the head and frees the surplus blocks
    let short = payload(100);
    store.r_update(id, &short).unwrap();
    assert_eq!(store.r_find(id).unwrap().unwrap(), short);

    //Growing again reuses the freed blocks instead of extending the file
    let long: Vec<u8> = payload(1000).iter().map(|b| b ^ 0xFF).collect();
    store.r_update(id, &long).unwrap();
    assert_eq!(store.r_find(id).unwrap().unwrap(), long);
    let dev = store.unmountstore();
    assert_eq!(dev.len(), 14 * BS);
    let mut store = StoreName::mountstore(dev, GEOMETRY).unwrap();

    //Updating down to empty leaves a single-block record
    store.r_update(id, &[]).unwrap();
    assert_eq!(store.r_find(id).unwrap().unwrap(), Vec::<u8>::new());
    store.r_update(id, &[1, 2, 3]).unwrap();
    assert_eq!(store.r_find(id).unwrap().unwrap(), vec![1, 2, 3]);

    utils::disk_destruct(store.unmountstore());
}

#[test]
fn free_list_spills_and_recycles_its_tail() {
    let path = disk_prep_path("spill");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    //21 single-block records fill pages 1..=21
    let ids: Vec<u32> = (0..21).map(|i| store.r_create(&[i as u8]).unwrap()).collect();
    assert_eq!(ids, (1..=21).collect::<Vec<u32>>());

    //Freeing all 21 overflows the 20-id capacity of the free-list head, so
    //the free record grows a tail block at page 22
    for id in &ids {
        store.r_delete(*id).unwrap();
    }
    let dev = store.unmountstore();
    assert_eq!(dev.len(), 23 * BS);
    let mut store = StoreName::mountstore(dev, GEOMETRY).unwrap();

    //Pops come back in LIFO order. Once the tail block runs dry it leaves
    //the chain and its own page is handed out too, so 22 creates fit
    //without extending the file.
    assert_eq!(store.r_create(&[0]).unwrap(), 21);
    assert_eq!(store.r_create(&[0]).unwrap(), 20);
    assert_eq!(store.r_create(&[0]).unwrap(), 22); //the recycled tail itself
    for expected in (1..=19).rev() {
        assert_eq!(store.r_create(&[0]).unwrap(), expected);
    }
    //The free list is dry again; the next create extends the file
    assert_eq!(store.r_create(&[0]).unwrap(), 23);
    let dev = store.unmountstore();
    assert_eq!(dev.len(), 24 * BS);

    utils::disk_destruct(dev);
}

#[test]
fn error_cases() {
    let path = disk_prep_path("errors");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    //The free-block record is not deletable
    assert!(store.r_delete(0).is_err());

    //Updates and deletes of absent records fail
    assert!(store.r_update(50, &[1]).is_err());
    assert!(store.r_delete(50).is_err());

    //A deleted record cannot be deleted or updated again
    let id = store.r_create(&[1, 2, 3]).unwrap();
    store.r_delete(id).unwrap();
    assert!(store.r_delete(id).is_err());
    assert!(store.r_update(id, &[4]).is_err());

    //Oversized payloads are refused up front
    let huge = vec![0u8; (4 * 1024 * 1024 + 1) as usize];
    assert!(store.r_create(&huge).is_err());

    utils::disk_destruct(store.unmountstore());
}
