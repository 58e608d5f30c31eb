#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Persistent model storage: a directory-backed blob cache with atomic
//! commit and a streaming downloader that fills it.

pub mod cache;
pub mod download;

mod error;

pub use cache::{CacheEntryMeta, CachedModel, ModelCache, QuotaEstimate};
pub use download::{DownloadProgress, DownloaderConfig, ModelDownloader};
pub use error::StoreError;

use sha2::{Digest, Sha256};

/// SHA-256 of `bytes` as lower-case hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sha256_hex;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
