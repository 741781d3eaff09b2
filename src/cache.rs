//! Local firmware cache: one well-known file, cleared before every fetch.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::traits::HttpClient;

/// Calculate SHA256 hash of a file
pub fn calculate_sha256(file_path: &Path) -> UpdateResult<String> {
    let mut file = fs::File::open(file_path)?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

/// Delete any cached firmware at `path`. No-op if it is absent.
pub fn ensure_cache_cleared(path: &Path) -> UpdateResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed cached firmware");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdateError::Io(e)),
    }
}

/// A downloaded firmware image sitting in the cache.
///
/// The file is removed when the image is discarded or dropped, so a run
/// never leaves it behind.
#[derive(Debug)]
pub struct CachedImage {
    path: PathBuf,
    bytes: Vec<u8>,
    sha256: String,
    removed: bool,
}

impl CachedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Delete the cached file now, reporting failures.
    pub fn discard(mut self) -> UpdateResult<()> {
        self.removed = true;
        ensure_cache_cleared(&self.path)
    }
}

impl Drop for CachedImage {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = ensure_cache_cleared(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove cached firmware");
        }
    }
}

/// Downloads firmware images into the cache file.
pub struct FirmwareFetcher<'a> {
    http: &'a dyn HttpClient,
    cache_path: PathBuf,
}

impl<'a> FirmwareFetcher<'a> {
    pub fn new(http: &'a dyn HttpClient, cache_path: &Path) -> Self {
        Self {
            http,
            cache_path: cache_path.to_path_buf(),
        }
    }

    /// Remove a stale image from a previous run.
    pub fn ensure_cache_cleared(&self) -> UpdateResult<()> {
        ensure_cache_cleared(&self.cache_path)
    }

    /// Fetch `url` into the cache file.
    ///
    /// On failure nothing is left at the cache path.
    pub fn download(&self, url: &str) -> UpdateResult<CachedImage> {
        info!(url, "downloading firmware");

        let download_error = |reason: String| UpdateError::Download {
            url: url.to_string(),
            reason,
        };

        let bytes = self.http.get_bytes(url).map_err(download_error)?;

        if let Err(e) = self.store(&bytes) {
            // Best effort: the write already failed, keep that error.
            let _ = ensure_cache_cleared(&self.cache_path);
            return Err(download_error(format!(
                "failed to write {}: {}",
                self.cache_path.display(),
                e
            )));
        }

        let sha256 = match calculate_sha256(&self.cache_path) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = ensure_cache_cleared(&self.cache_path);
                return Err(download_error(format!("failed to hash image: {}", e)));
            }
        };

        info!(
            path = %self.cache_path.display(),
            size = bytes.len(),
            sha256 = %sha256,
            "firmware downloaded"
        );

        Ok(CachedImage {
            path: self.cache_path.clone(),
            bytes,
            sha256,
            removed: false,
        })
    }

    fn store(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.cache_path, bytes)
    }
}
