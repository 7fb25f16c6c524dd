//! Implementation of a growable physical device and a simple controller for it.
//!
//! The device is represented by a file in the host file system, memory mapped
//! into a `Device` struct. A store starts from an empty file and appends one
//! block at a time, so unlike a fixed-size disk image the mapping is recreated
//! whenever the file is extended.
//!
//! No provisions have been made to lock the backing file; two devices on the
//! same path lead to undefined behavior.

use crate::error::{APIError, Result};
use memmap::MmapMut;
use std::{
    fs::{remove_file, File, OpenOptions},
    path::{Path, PathBuf},
};

/// Struct representing the state of the backing device.
///
/// The implementation of this structure is the controller that lets the block
/// layer read, write and extend the underlying byte stream.
#[derive(Debug)]
pub struct Device {
    /// Path to the file that is used as a storage area to emulate the device
    path: PathBuf,
    /// Open handle on the backing file, kept for `set_len` when extending
    file: File,
    /// Memory-mapped contents of the file; `None` while the file is empty,
    /// since a zero-length mapping is rejected by the operating system
    contents: Option<MmapMut>,
    /// Current length of the backing file in bytes
    len: u64,
}

/// Small enum, used to specify whether we expect to open a new device image
#[derive(PartialEq, Eq, Copy, Clone)]
enum DiskState {
    /// Creating a new device image
    New,
    /// Loading an existing device image
    Load,
}

use self::DiskState::*;
impl DiskState {
    fn of(exists: bool) -> DiskState {
        match exists {
            true => Load,
            false => New,
        }
    }
}

impl Drop for Device {
    /// Persist outstanding writes before the mapping is released.
    /// Only needed if the file backing this device still exists.
    fn drop(&mut self) {
        if self.path.exists() {
            if let Some(m) = &self.contents {
                m.flush().unwrap();
            }
        }
    }
}

impl Device {
    fn create_device<P: AsRef<Path>>(path: P, ds: DiskState) -> Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let exists = DiskState::of(path.as_ref().exists());
        if exists != ds {
            if ds == Load {
                return Err(APIError::ControllerInput(
                    "tried to load a non-existing file path",
                ));
            } else {
                return Err(APIError::ControllerInput(
                    "tried to create a pre-existing file path",
                ));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let contents = Device::map_file(&file, len)?;
        Ok(Device {
            path: path_buf,
            file,
            contents,
            len,
        })
    }

    /// Create a *new*, empty device at `path`.
    /// Returns an error if the file represented by `path` already exists.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Device> {
        Device::create_device(path, New)
    }

    /// Load an *existing* device from `path`.
    /// Returns an error if the file represented by `path` does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Device> {
        Device::create_device(path, Load)
    }

    fn map_file(file: &File, len: u64) -> Result<Option<MmapMut>> {
        if len == 0 {
            return Ok(None);
        }
        let map = unsafe { memmap::MmapOptions::new().map_mut(file)? };
        Ok(Some(map))
    }

    /// End the lifetime of this device, and remove the file backing it.
    /// Assumes that no other links to the backing file exist.
    /// Panics if removing the file fails; meant for tests.
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Current size of this device in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True iff the backing file holds no bytes yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the file backing this device
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Grow the device by `n` zero bytes.
    ///
    /// Outstanding writes are flushed, the file is extended, and the mapping
    /// is rebuilt over the new length.
    pub fn extend_by(&mut self, n: u64) -> Result<()> {
        if let Some(m) = &self.contents {
            m.flush()?;
        }
        self.contents = None;
        let new_len = self.len + n;
        self.file.set_len(new_len)?;
        self.contents = Device::map_file(&self.file, new_len)?;
        self.len = new_len;
        Ok(())
    }

    /// Read `dst.len()` bytes from the device starting at address `addr`.
    /// Results in an error if the read extends past the end of the device.
    pub fn read_into(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        if addr + dst.len() as u64 > self.len {
            return Err(APIError::ControllerInput("read past the end of the device"));
        }
        if dst.is_empty() {
            return Ok(());
        }
        let contents = self
            .contents
            .as_ref()
            .ok_or(APIError::ControllerInput("read from an empty device"))?;
        let start = addr as usize;
        dst.copy_from_slice(&contents[start..start + dst.len()]);
        Ok(())
    }

    /// Write the given bytes into the device at address `addr`.
    /// Results in an error if the write extends past the end of the device.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if addr + bytes.len() as u64 > self.len {
            return Err(APIError::ControllerInput(
                "write past the end of the device",
            ));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let contents = self
            .contents
            .as_mut()
            .ok_or(APIError::ControllerInput("write to an empty device"))?;
        let start = addr as usize;
        contents[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Flush the whole mapping back to the file system.
    pub fn flush(&self) -> Result<()> {
        if let Some(m) = &self.contents {
            m.flush()?;
        }
        Ok(())
    }

    /// Flush `n` bytes starting at address `addr` back to the file system.
    pub fn flush_range(&self, addr: u64, n: usize) -> Result<()> {
        if let Some(m) = &self.contents {
            m.flush_range(addr as usize, n)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::Device;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    //Returns the path to the image we will use during the tests.
    //To avoid parallel tests from overlapping, each test passes in its own unique `name` string.
    //Also creates any missing directories and removes a stale image if one exists.
    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("device-images-".to_string() + name);
        path.push("img");

        if path.exists() {
            remove_file(&path).unwrap();
        }
        {
            let prefix = path.parent().unwrap();
            create_dir_all(prefix).unwrap();
        }

        return path;
    }

    //Destruct the given device and remove the parent directory it was located in
    fn disk_destruct(dev: Device) {
        let path = dev.device_path().to_owned();
        dev.destruct();
        remove_dir(path.parent().unwrap()).unwrap(); //Safety measure; will only delete an empty directory
    }

    #[test]
    fn create_grow_rw_test() {
        let path = disk_prep_path("create");
        let mut dev = Device::new(&path).unwrap();
        assert_eq!(dev.len(), 0);
        assert!(dev.is_empty());
        //Creating the same path twice is refused
        assert!(Device::new(&path).is_err());

        //Reads and writes on an empty device fail
        let mut buf = [0u8; 4];
        assert!(dev.read_into(0, &mut buf).is_err());
        assert!(dev.write(0, &buf).is_err());

        dev.extend_by(128).unwrap();
        assert_eq!(dev.len(), 128);
        //Fresh bytes are zero-filled
        let mut buf = [1u8; 16];
        dev.read_into(64, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        dev.write(120, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        //Past-the-end accesses are refused
        assert!(dev.write(121, &[0u8; 8]).is_err());
        assert!(dev.read_into(121, &mut [0u8; 8]).is_err());

        //Data survives an extension
        dev.extend_by(128).unwrap();
        assert_eq!(dev.len(), 256);
        let mut buf = [0u8; 8];
        dev.read_into(120, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        disk_destruct(dev);
        assert!(!path.exists());
    }

    #[test]
    fn load_existing_disk_test() {
        let path = disk_prep_path("load");
        //Loading a missing path is refused
        assert!(Device::load(&path).is_err());

        let mut dev = Device::new(&path).unwrap();
        dev.extend_by(256).unwrap();
        dev.write(0, &[9, 9, 9]).unwrap();
        dev.write(200, &[7]).unwrap();
        dev.flush().unwrap();

        //Close the device by dropping it
        drop(dev);

        //Reopen the device and assert that our old data is still there
        let dev = Device::load(&path).unwrap();
        assert_eq!(dev.len(), 256);
        let mut buf = [0u8; 3];
        dev.read_into(0, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9]);
        let mut buf = [0u8; 1];
        dev.read_into(200, &mut buf).unwrap();
        assert_eq!(buf, [7]);

        disk_destruct(dev);
        assert!(!path.exists());
    }
}
