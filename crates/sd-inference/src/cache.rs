//! File-backed cache of fitted results, keyed by file name.
//!
//! A cached value is plain JSON. When the file exists it is loaded instead
//! of recomputing; otherwise the value is computed and written.

use std::fs;
use std::path::Path;

use sd_core::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Read from an existing file.
    Hit,
    /// Computed and written.
    Miss,
}

/// Load `path` if it exists, else run `compute` and persist its output.
pub fn load_or_compute<T, F>(path: &Path, compute: F) -> Result<(T, CacheStatus)>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    if path.exists() {
        let bytes = fs::read(path)?;
        let value = serde_json::from_slice(&bytes)?;
        log::info!("cache hit: {}", path.display());
        return Ok((value, CacheStatus::Hit));
    }

    let value = compute()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(&value)?)?;
    log::info!("cache miss: wrote {}", path.display());
    Ok((value, CacheStatus::Miss))
}
