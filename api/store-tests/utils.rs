#![allow(dead_code)]

//Some more general testing utilities
use bstore_api::controller::Device;
use std::fs::{create_dir_all, remove_dir, remove_file};
use std::path::{Path, PathBuf};

//Create the necessary folder 'name' leading up to 'img_name', starting from the crate root
//Additionally, remove 'img_name' if it already exists in the file system, so we start fresh
pub fn disk_prep_path(name: &str, img_name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(name);
    path.push(img_name);

    if path.exists() {
        //Remove the file in case it already exists
        remove_file(&path).unwrap();
    }
    {
        //Create any missing directories first, if applicable
        let prefix = path.parent().unwrap();
        create_dir_all(prefix).unwrap();
    }

    return path;
}

//Undo folder creation, including removing the parent
pub fn disk_unprep_path(path: &Path) {
    //Ensure that the file has been deleted before going on
    remove_file(path).unwrap();

    let parent = path.parent().unwrap();
    remove_dir(parent).unwrap(); //Safety; only remove if empty
}

//Destruct the given device and remove the parent directory it was located in
pub fn disk_destruct(dev: Device) {
    let path = dev.device_path().to_owned();
    drop(dev); //Flush the mapping before touching the backing file
    disk_unprep_path(&path);
}

//Remove a set of sibling store files and their common parent directory
pub fn files_unprep(paths: &[&Path]) {
    for path in paths {
        if path.exists() {
            remove_file(path).unwrap();
        }
    }
    let parent = paths[0].parent().unwrap();
    remove_dir(parent).unwrap();
}
