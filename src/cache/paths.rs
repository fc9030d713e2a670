//! Artifact path derivation
//!
//! Layout (hash_length = 12, shard_depth = 2, shard_width = 2):
//! - `<root>/3f/a9/3fa91c07be22.nc`
//!
//! The hash is the hex SHA-224 of the CRS, truncated. Shard directories are
//! consecutive slices of the same hash, bounding directory fan-out.
use sha2::{Digest, Sha224};
use std::path::{Path, PathBuf};

/// Hex length of an untruncated SHA-224
pub const FULL_HASH_LENGTH: usize = 56;

pub fn crs_digest(crs: &str) -> String {
    hex::encode(Sha224::digest(crs.as_bytes()))
}

/// Hash truncation and sharding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub hash_length: usize,
    pub shard_depth: usize,
    pub shard_width: usize,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            hash_length: 32,
            shard_depth: 2,
            shard_width: 2,
        }
    }
}

impl Layout {
    pub fn validate(&self) -> Result<(), String> {
        if !(8..=FULL_HASH_LENGTH).contains(&self.hash_length) {
            return Err(format!(
                "hash_length must be between 8 and {}, got {}",
                FULL_HASH_LENGTH, self.hash_length
            ));
        }
        if self.shard_depth > 0 && self.shard_width == 0 {
            return Err("shard_width must be positive when shard_depth is set".to_string());
        }
        if self.shard_depth * self.shard_width >= self.hash_length {
            return Err(format!(
                "shard_depth * shard_width ({}) must be below hash_length ({})",
                self.shard_depth * self.shard_width,
                self.hash_length
            ));
        }
        Ok(())
    }

    /// Path below the cache root for `digest` truncated to `length`
    pub fn relative_path(&self, digest: &str, length: usize, extension: &str) -> PathBuf {
        let hash = &digest[..length.min(digest.len())];
        let mut path = PathBuf::new();
        for level in 0..self.shard_depth {
            let start = level * self.shard_width;
            if let Some(shard) = hash.get(start..start + self.shard_width) {
                path.push(shard);
            }
        }
        path.push(format!("{}.{}", hash, extension));
        path
    }
}

/// Temporary sibling of `final_path`: `<stem>.tmp<pid>.<ext>`
pub fn temp_path(final_path: &Path) -> PathBuf {
    let stem = final_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match final_path.extension() {
        Some(ext) => format!("{}.tmp{}.{}", stem, std::process::id(), ext.to_string_lossy()),
        None => format!("{}.tmp{}", stem, std::process::id()),
    };
    final_path.with_file_name(name)
}

pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(".tmp"))
        .unwrap_or(false)
}
