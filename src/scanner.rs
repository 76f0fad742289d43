//! The Scanner: walks the managed directories and fingerprints every file.
//!
//! Knows nothing about the registry. Checksums are expensive on media files,
//! so each observation is cached and reused while size and mtime are unchanged.

use crate::error::{MediaError, Result};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tokio_util::sync::CancellationToken;

pub const IGNORE_FILE: &str = ".mediavaultignore";

const CHECKSUM_PREFIX: &str = "sha256:";
const READ_CHUNK: usize = 64 * 1024;

// Names that are never managed media, whatever the ignore file says.
const IGNORED_EXACT: &[&str] = &[
    "thumbs.db",
    "ehthumbs.db",
    "desktop.ini",
    "icon?",
    "$recycle.bin",
    "system volume information",
];

// Files a collaborator is still writing, or editor/OS leftovers.
const IGNORED_EXTENSIONS: &[&str] = &["part", "partial", "crdownload", "tmp", "swp", "lock"];

/// Canonical description of one file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ns: i64,
    pub checksum: String,
}

impl Fingerprint {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// File name for display; non-UTF-8 bytes are replaced.
    pub fn display_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Everything one scan saw.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub fingerprints: BTreeMap<PathBuf, Fingerprint>,
    /// Files that exist but could not be read, with the reason.
    pub unreadable: BTreeMap<PathBuf, String>,
    /// How many checksums were actually computed (the rest came from cache).
    pub hashed: usize,
}

/// Per-root ignore rules: `.mediavaultignore` names plus built-in defaults.
struct IgnoreRules {
    rules: HashMap<PathBuf, HashSet<String>>,
}

impl IgnoreRules {
    fn new() -> Self { Self { rules: HashMap::new() } }

    fn load_rules_for_root(&mut self, root: &Path) {
        let mut new_rules = HashSet::new();

        // DEFAULT IGNORES
        new_rules.insert(IGNORE_FILE.to_string());
        new_rules.insert(".mediavault".to_string());
        new_rules.insert(".git".to_string());

        if let Ok(content) = fs::read_to_string(root.join(IGNORE_FILE)) {
            for line in content.lines() {
                let rule = line.trim();
                if !rule.is_empty() && !rule.starts_with('#') {
                    new_rules.insert(rule.to_string());
                }
            }
        }
        self.rules.insert(root.to_path_buf(), new_rules);
    }

    fn is_ignored(&self, root: &Path, abs_path: &Path) -> bool {
        let Ok(relative) = abs_path.strip_prefix(root) else { return false };
        let rules = self.rules.get(root);
        for component in relative.components() {
            let comp_str = component.as_os_str().to_string_lossy();
            if rules.map_or(false, |r| r.contains(comp_str.as_ref())) || is_noise(&comp_str) {
                return true;
            }
        }
        false
    }
}

/// Would a scan of `roots` fingerprint `path`? The path must sit under one of
/// the roots and pass that root's ignore rules.
pub fn is_managed_path(roots: &[PathBuf], path: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    let Some(root) = roots.iter().find(|r| path.starts_with(r) && path != r.as_path()) else {
        return false;
    };
    let mut rules = IgnoreRules::new();
    rules.load_rules_for_root(root);
    !rules.is_ignored(root, path)
}

/// True if a scan of `roots` would reach `path`: no directory between the
/// root and the file is a symlink (the walk never follows links).
pub fn is_walkable(roots: &[PathBuf], path: &Path) -> bool {
    let Some(root) = roots.iter().find(|r| path.starts_with(r)) else {
        return false;
    };
    path.ancestors()
        .skip(1)
        .take_while(|dir| *dir != root.as_path())
        .all(|dir| !fs::symlink_metadata(dir).map(|m| m.file_type().is_symlink()).unwrap_or(false))
}

/// Hidden files, backups, OS metadata and partially written downloads.
pub fn is_noise(name: &str) -> bool {
    let name_lower = name.to_lowercase();

    if name.starts_with('.') || name.ends_with('~') {
        return true;
    }

    if IGNORED_EXACT.contains(&name_lower.as_str()) {
        return true;
    }

    if let Some(idx) = name_lower.rfind('.') {
        if idx + 1 < name_lower.len() && IGNORED_EXTENSIONS.contains(&&name_lower[idx + 1..]) {
            return true;
        }
    }
    false
}

pub struct Scanner {
    observations: Mutex<LruCache<PathBuf, Fingerprint>>,
    always_rehash: bool,
}

impl Scanner {
    pub fn new(cache_capacity: usize, always_rehash: bool) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            observations: Mutex::new(LruCache::new(capacity)),
            always_rehash,
        }
    }

    /// Seed the observation cache with fingerprints known from elsewhere.
    /// Existing observations win.
    pub fn prime(&self, known: impl IntoIterator<Item = Fingerprint>) -> Result<()> {
        let mut cache = self.observations.lock().map_err(|_| MediaError::poisoned())?;
        for fp in known {
            if !cache.contains(&fp.path) {
                cache.put(fp.path.clone(), fp);
            }
        }
        Ok(())
    }

    /// Fingerprint a single file, reusing a cached checksum when possible.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        self.fingerprint_counted(path).map(|(fp, _)| fp)
    }

    fn fingerprint_counted(&self, path: &Path) -> Result<(Fingerprint, bool)> {
        // Same view as the walk: a symlink is not a managed file.
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(MediaError::InvalidPath(format!("{} is a symlink", path.display())));
        }
        if !meta.is_file() {
            return Err(MediaError::InvalidPath(format!("{} is not a regular file", path.display())));
        }
        let size = meta.len();
        let mtime_ns = mtime_ns(&meta);

        if !self.always_rehash {
            let mut cache = self.observations.lock().map_err(|_| MediaError::poisoned())?;
            if let Some(seen) = cache.get(path) {
                if seen.size == size && seen.mtime_ns == mtime_ns {
                    return Ok((seen.clone(), false));
                }
            }
        }

        let checksum = checksum_file(path)?;
        let fp = Fingerprint { path: path.to_path_buf(), size, mtime_ns, checksum };
        self.observations
            .lock()
            .map_err(|_| MediaError::poisoned())?
            .put(path.to_path_buf(), fp.clone());
        Ok((fp, true))
    }

    /// Walk every root and fingerprint every managed file.
    ///
    /// A root (or any directory under it) that cannot be listed fails the
    /// whole scan. A file that cannot be read is reported in `unreadable`.
    pub fn scan(&self, roots: &[PathBuf], cancel: &CancellationToken) -> Result<ScanOutput> {
        let mut ignore = IgnoreRules::new();
        let mut output = ScanOutput::default();

        for root in roots {
            match fs::read_dir(root) {
                Ok(_) => {}
                Err(e) => {
                    return Err(MediaError::Scan { path: root.clone(), reason: e.to_string() });
                }
            }
            ignore.load_rules_for_root(root);

            let walker = walkdir::WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !ignore.is_ignored(root, e.path()));

            for entry in walker {
                if cancel.is_cancelled() {
                    return Err(MediaError::Cancelled);
                }
                let entry = entry.map_err(|e| MediaError::Scan {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
                    reason: e.to_string(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.path();
                match self.fingerprint_counted(path) {
                    Ok((fp, hashed)) => {
                        if hashed {
                            output.hashed += 1;
                        }
                        output.fingerprints.insert(path.to_path_buf(), fp);
                    }
                    // Deleted between listing and hashing: simply absent.
                    Err(MediaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("[Scanner] Unreadable file {}: {}", path.display(), e);
                        output.unreadable.insert(path.to_path_buf(), e.to_string());
                    }
                }
            }
        }

        tracing::debug!("[Scanner] Scanned {} files ({} hashed, {} unreadable)",
            output.fingerprints.len(), output.hashed, output.unreadable.len());
        Ok(output)
    }
}

pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{}{}", CHECKSUM_PREFIX, hex::encode(hasher.finalize())))
}

pub fn mtime_ns(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
