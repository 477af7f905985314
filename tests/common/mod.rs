#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A fresh temporary directory, removed when the guard is dropped.
pub fn scratch(label: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("pm-analysis-{label}-"))
        .tempdir()
        .expect("create scratch dir")
}

/// Every path under `root`, relative to it.
pub fn tree(root: &Path) -> BTreeSet<PathBuf> {
    let mut out = BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("read_dir") {
            let path = entry.expect("dir entry").path();
            out.insert(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    out
}
