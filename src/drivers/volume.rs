// Storage collaborator: open/size/read/close plus an optional direct view
// of a file's bytes when they sit contiguously in addressable memory
// (flash-resident system images).
//
// MemVolume is a small table-driven volume: "mapped" entries point into
// flash, "ram" entries are owned buffers. The firmware serves its demo
// images from one; the tests use it too.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::debug;

// concurrently open handles per volume
pub const MAX_OPEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    BadHandle,
    TooManyOpen,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "no such file"),
            StorageError::BadHandle => write!(f, "stale file handle"),
            StorageError::TooManyOpen => write!(f, "too many open files"),
        }
    }
}

pub trait Volume {
    type Handle: Copy;

    fn open(&mut self, path: &str) -> Result<Self::Handle, StorageError>;

    fn size(&self, file: Self::Handle) -> Result<usize, StorageError>;

    /// Contiguous, directly addressable bytes of the file, if the volume
    /// keeps it that way.
    fn physical_address(&self, file: Self::Handle) -> Option<&'static [u8]>;

    fn read(&mut self, file: Self::Handle, offset: usize, buf: &mut [u8]) -> Result<usize, StorageError>;

    fn close(&mut self, file: Self::Handle);
}

enum Body {
    Mapped(&'static [u8]),
    Ram(Vec<u8>),
}

impl Body {
    fn bytes(&self) -> &[u8] {
        match self {
            Body::Mapped(b) => b,
            Body::Ram(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(u8);

pub struct MemVolume {
    files: Vec<(String, Body)>,
    open: [Option<usize>; MAX_OPEN],
    opens: u32,
    bytes_read: usize,
}

impl Default for MemVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl MemVolume {
    pub const fn new() -> Self {
        Self {
            files: Vec::new(),
            open: [None; MAX_OPEN],
            opens: 0,
            bytes_read: 0,
        }
    }

    // replaces an existing entry with the same path
    pub fn add_mapped(&mut self, path: &str, bytes: &'static [u8]) {
        self.insert(path, Body::Mapped(bytes));
    }

    pub fn add_file(&mut self, path: &str, bytes: &[u8]) {
        self.insert(path, Body::Ram(Vec::from(bytes)));
    }

    fn insert(&mut self, path: &str, body: Body) {
        match self.files.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = body,
            None => self.files.push((String::from(path), body)),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.iter().any(|(p, _)| p == path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(p, _)| p.as_str())
    }

    pub fn open_handles(&self) -> usize {
        self.open.iter().filter(|s| s.is_some()).count()
    }

    pub fn opens(&self) -> u32 {
        self.opens
    }

    // total bytes copied out through read()
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    fn body(&self, file: FileHandle) -> Result<&Body, StorageError> {
        let idx = self
            .open
            .get(file.0 as usize)
            .copied()
            .flatten()
            .ok_or(StorageError::BadHandle)?;
        self.files
            .get(idx)
            .map(|(_, b)| b)
            .ok_or(StorageError::BadHandle)
    }
}

impl Volume for MemVolume {
    type Handle = FileHandle;

    fn open(&mut self, path: &str) -> Result<FileHandle, StorageError> {
        let idx = self
            .files
            .iter()
            .position(|(p, _)| p == path)
            .ok_or(StorageError::NotFound)?;
        let slot = self
            .open
            .iter()
            .position(Option::is_none)
            .ok_or(StorageError::TooManyOpen)?;
        self.open[slot] = Some(idx);
        self.opens += 1;
        debug!("volume: open {} -> handle {}", path, slot);
        Ok(FileHandle(slot as u8))
    }

    fn size(&self, file: FileHandle) -> Result<usize, StorageError> {
        Ok(self.body(file)?.bytes().len())
    }

    fn physical_address(&self, file: FileHandle) -> Option<&'static [u8]> {
        match self.body(file) {
            Ok(Body::Mapped(b)) => Some(*b),
            _ => None,
        }
    }

    fn read(&mut self, file: FileHandle, offset: usize, buf: &mut [u8]) -> Result<usize, StorageError> {
        let bytes = self.body(file)?.bytes();
        let start = offset.min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.bytes_read += n;
        Ok(n)
    }

    fn close(&mut self, file: FileHandle) {
        if let Some(slot) = self.open.get_mut(file.0 as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static FLASH: &[u8] = b"flash resident";

    #[test]
    fn mapped_files_expose_their_bytes() {
        let mut vol = MemVolume::new();
        vol.add_mapped("/bin/x", FLASH);
        vol.add_file("/lib/y", b"ram");

        let x = vol.open("/bin/x").unwrap();
        let y = vol.open("/lib/y").unwrap();
        assert_eq!(vol.physical_address(x), Some(FLASH));
        assert_eq!(vol.physical_address(y), None);
        assert_eq!(vol.size(y), Ok(3));
        assert_eq!(vol.open_handles(), 2);
        assert!(vol.exists("/lib/y"));
        assert_eq!(vol.paths().collect::<Vec<_>>(), ["/bin/x", "/lib/y"]);

        vol.close(x);
        vol.close(y);
        assert_eq!(vol.open_handles(), 0);
        assert_eq!(vol.size(x), Err(StorageError::BadHandle));
    }

    #[test]
    fn reads_are_offset_and_counted() {
        let mut vol = MemVolume::new();
        vol.add_file("f", b"0123456789");
        let f = vol.open("f").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vol.read(f, 8, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"89");
        assert_eq!(vol.read(f, 20, &mut buf), Ok(0));
        assert_eq!(vol.bytes_read(), 2);
    }

    #[test]
    fn handle_table_is_bounded() {
        let mut vol = MemVolume::new();
        vol.add_file("f", b"");
        for _ in 0..MAX_OPEN {
            vol.open("f").unwrap();
        }
        assert_eq!(vol.open("f"), Err(StorageError::TooManyOpen));
        assert_eq!(vol.open("missing"), Err(StorageError::NotFound));
    }
}
