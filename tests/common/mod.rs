//! Shared sandbox for integration tests
//!
//! Each sandbox is a temp dir with one managed directory (`media/`) and the
//! registry files kept outside it (`state/`).

#![allow(dead_code)] // Not every test file uses every helper

use mediavault::{EngineConfig, Registry};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Sandbox {
    _dir: TempDir,
    pub media: PathBuf,
    pub state: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let media = dir.path().join("media");
        let state = dir.path().join("state");
        fs::create_dir_all(&media).expect("create media dir");
        Self { _dir: dir, media, state }
    }

    /// Config suited to tests: no orphan grace, fast retries, no startup pass.
    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.state.join("registry.db"), vec![self.media.clone()]);
        config.orphan_grace_secs = 0;
        config.reconcile_on_startup = false;
        config.retry.base_delay_ms = 1;
        config.librarian.debounce_ms = 50;
        config
    }

    pub fn open(&self) -> Registry {
        Registry::open(self.config()).expect("open registry")
    }

    /// Write `bytes` at `rel` under the managed dir, creating parents.
    pub fn write(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.media.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, bytes).expect("write media file");
        path
    }

    pub fn primary(&self) -> PathBuf {
        self.state.join("registry.db")
    }

    pub fn backup(&self) -> PathBuf {
        self.config().backup_path()
    }
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
