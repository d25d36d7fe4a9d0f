use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Where level scripts are read from.
pub trait FileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
}

impl fmt::Debug for dyn FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileSystem")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

impl FileSystem for HostFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }
}
