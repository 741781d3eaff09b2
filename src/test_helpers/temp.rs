use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory standing in for the cache and settings locations.
/// Removed with everything in it when dropped.
pub struct TestContext {
    dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("scratch dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// `relative` resolved inside the scratch dir; nothing is created.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Write `content` to `relative`, creating parents as needed.
    pub fn create_file(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dirs");
        }
        fs::write(&path, content).expect("write scratch file");
        path
    }

    pub fn create_dir(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(&path).expect("scratch subdir");
        path
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).exists()
    }

    pub fn read_file(&self, relative: &str) -> Vec<u8> {
        fs::read(self.path(relative)).expect("read scratch file")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
