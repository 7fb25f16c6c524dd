use super::StoreName;
use bstore_api::controller::Device;
use bstore_api::store::{BlockSupport, StoreSupport};
use bstore_api::types::{Geometry, IS_DELETED, NEXT_BLOCK_ID, RECORD_LENGTH};
use std::path::PathBuf;
use std::rc::Rc;

#[path = "utils.rs"]
mod utils;

//A geometry whose sector (128 bytes) is smaller than its blocks, so content
//is split between the buffered sector and the device
static GEOMETRY: Geometry = Geometry {
    block_size: 256,
    header_size: 48,
};

fn disk_prep_path(name: &str) -> PathBuf {
    utils::disk_prep_path(&("store-images-block-".to_string() + name), "img")
}

#[test]
fn mkstore() {
    let path = disk_prep_path("mkstore");

    //Invalid geometries are refused
    let bad = Geometry {
        block_size: 64,
        header_size: 48,
    };
    assert!(StoreName::mkstore(&path, bad).is_err());

    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();
    assert_eq!(store.geometry(), GEOMETRY);

    //Ids are the dense, zero-based page indices
    for expected in 0..3 {
        let block = store.b_new().unwrap();
        assert_eq!(block.borrow().id(), expected);
        store.b_release(block).unwrap();
    }
    assert!(store.b_find(2).unwrap().is_some());
    assert!(store.b_find(3).unwrap().is_none());

    let dev = store.unmountstore();
    assert_eq!(dev.len(), 3 * 256);
    utils::disk_destruct(dev);
}

#[test]
fn mount_misaligned() {
    let path = disk_prep_path("misaligned");
    //A file that is not a whole number of blocks is refused
    std::fs::write(&path, vec![0u8; 100]).unwrap();
    let dev = Device::load(&path).unwrap();
    assert!(StoreName::mountstore(dev, GEOMETRY).is_err());
    utils::disk_unprep_path(&path);
}

#[test]
fn headers_persist() {
    let path = disk_prep_path("headers");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    let block = store.b_new().unwrap();
    block.borrow_mut().set_header(NEXT_BLOCK_ID, 7).unwrap();
    block.borrow_mut().set_header(RECORD_LENGTH, 1000).unwrap();
    block.borrow_mut().set_header(IS_DELETED, 1).unwrap();
    store.b_release(block.clone()).unwrap();

    //Double release is a no-op, any other use of a released block fails
    store.b_release(block.clone()).unwrap();
    assert!(block.borrow_mut().get_header(NEXT_BLOCK_ID).is_err());
    assert!(block.borrow_mut().set_header(NEXT_BLOCK_ID, 0).is_err());

    let dev = store.unmountstore();
    drop(dev);
    let dev = Device::load(&path).unwrap();
    let mut store = StoreName::mountstore(dev, GEOMETRY).unwrap();
    let block = store.b_find(0).unwrap().unwrap();
    assert_eq!(block.borrow_mut().get_header(NEXT_BLOCK_ID).unwrap(), 7);
    assert_eq!(block.borrow_mut().get_header(RECORD_LENGTH).unwrap(), 1000);
    assert_eq!(block.borrow_mut().get_header(IS_DELETED).unwrap(), 1);
    store.b_release(block).unwrap();

    utils::disk_destruct(store.unmountstore());
}

#[test]
fn content_across_the_sector() {
    let path = disk_prep_path("content");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();
    //256-byte blocks, 48-byte headers: 208 content bytes, the first 80 of
    //which sit inside the buffered sector
    let content = GEOMETRY.content_size() as usize;
    assert_eq!(content, 208);

    let block = store.b_new().unwrap();
    let data: Vec<u8> = (0..content).map(|i| (i % 251) as u8).collect();
    store.b_write(&block, &data, 0, 0, content).unwrap();

    //Read everything back, and a window straddling the sector boundary
    let mut back = vec![0u8; content];
    store.b_read(&block, &mut back, 0, 0, content).unwrap();
    assert_eq!(back, data);
    let mut window = vec![0u8; 20];
    store.b_read(&block, &mut window, 0, 70, 20).unwrap();
    assert_eq!(window, &data[70..90]);

    //Out-of-bounds accesses fail deterministically
    assert!(store.b_read(&block, &mut [0u8; 1], 0, content, 1).is_err());
    assert!(store.b_write(&block, &[1], 0, content, 1).is_err());
    assert!(store.b_read(&block, &mut [0u8; 4], 2, 0, 4).is_err());
    assert!(store.b_write(&block, &[1, 2], 1, 0, 2).is_err());

    store.b_release(block).unwrap();

    //Both halves survive a remount
    let dev = store.unmountstore();
    drop(dev);
    let mut store = StoreName::mountstore(Device::load(&path).unwrap(), GEOMETRY).unwrap();
    let block = store.b_find(0).unwrap().unwrap();
    let mut back = vec![0u8; content];
    store.b_read(&block, &mut back, 0, 0, content).unwrap();
    assert_eq!(back, data);
    store.b_release(block).unwrap();

    utils::disk_destruct(store.unmountstore());
}

#[test]
fn cache_identity() {
    let path = disk_prep_path("cache");
    let mut store = StoreName::mkstore(&path, GEOMETRY).unwrap();

    let created = store.b_new().unwrap();
    //While a block is live, finds hand out the same instance
    let found = store.b_find(0).unwrap().unwrap();
    assert!(Rc::ptr_eq(&created, &found));

    //After a release, a find loads a fresh instance
    store.b_release(found).unwrap();
    let reloaded = store.b_find(0).unwrap().unwrap();
    assert!(!Rc::ptr_eq(&created, &reloaded));
    assert!(!reloaded.borrow().is_released());
    store.b_release(reloaded).unwrap();

    utils::disk_destruct(store.unmountstore());
}
