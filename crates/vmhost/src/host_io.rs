//! File and entropy callbacks the engine uses for its own I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Opens `name` for reading, or truncates/creates it for writing.
pub fn open_file(name: &Path, write: bool) -> io::Result<File> {
    if write {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(name)
    } else {
        File::open(name)
    }
}

/// Reads the remainder of `file`.
pub fn read_file(file: &mut File) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    file.read_to_end(&mut out)?;
    Ok(out)
}

pub fn write_file(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)
}

/// Fills `buf` from the OS entropy source.
pub fn fill_entropy(buf: &mut [u8]) -> bool {
    getrandom::getrandom(buf).is_ok()
}
