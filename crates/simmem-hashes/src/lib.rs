// SPDX-License-Identifier: AGPL-3.0

//! Content hashing for checkpoint cache keys

use sha3::{Digest, Sha3_256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Compute the SHA3-256 digest of `data`
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Hex-encoded SHA3-256 digest of `data`
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(sha3_256(data))
}

/// Hex-encoded SHA3-256 digest of a file, read in chunks
pub fn file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha3_256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
