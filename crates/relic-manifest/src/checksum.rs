//! MD5 content checksums for manifest entries.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the MD5 hex digest of the given bytes.
#[inline]
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Stream a file through MD5, returning `(checksum, size)`.
///
/// Symlinks are followed, so this reports on the content a link resolves to.
pub fn compute_checksum<P: AsRef<Path>>(path: P) -> io::Result<(String, u64)> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}
