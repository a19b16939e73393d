//! Namespace lookup by inode through `/proc/<pid>/ns/net`.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::control::watchers::{Namespace, NamespaceDirectory};

pub struct ProcNamespaces {
    root: PathBuf,
}

impl ProcNamespaces {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        ProcNamespaces {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for ProcNamespaces {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceDirectory for ProcNamespaces {
    fn lookup(&self, inum: u64) -> Option<Namespace> {
        fs::read_dir(&self.root)
            .ok()?
            .flatten()
            .filter(|e| e.file_name().to_str().is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit())))
            .map(|e| e.path().join("ns").join("net"))
            .find(|p| fs::metadata(p).is_ok_and(|m| m.ino() == inum))
            .map(|path| Namespace { inum, path })
    }
}
