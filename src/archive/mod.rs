//! Archive Manager: reassembles the split dataset archive, extracts it into the
//! dataset root and removes the extracted tree on teardown.
//!
//! The compressed parts are only ever read, and the archive directory may not
//! live inside the dataset root. Both `setup` and `teardown` are idempotent.
//! Extraction goes to a staging directory next to the dataset root which is
//! swapped into place only once it is complete, so a failed setup leaves any
//! existing dataset root as it was.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::ArchiveConfig;

pub mod extract;
pub mod parts;

pub use parts::ArchivePart;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no archive parts named {name}.part<N> (and no {name}) found in {dir}")]
    NoParts { dir: PathBuf, name: String },

    #[error("archive part {index} is missing")]
    MissingPart { index: u32 },

    #[error("archive part {index} appears more than once")]
    DuplicatePart { index: u32 },

    #[error("expected {expected} archive parts, found {found}")]
    PartCountMismatch { expected: usize, found: usize },

    #[error("archive directory {archive_dir} is inside dataset root {dataset_root}")]
    Overlap {
        archive_dir: PathBuf,
        dataset_root: PathBuf,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction failed ({status}): {stderr}")]
    Extract { status: String, stderr: String },

    #[error("extracted dataset is missing expected entries: {missing:?}")]
    Incomplete { missing: Vec<String> },
}

impl SetupError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("refusing to remove {dataset_root}: it contains the archive directory {archive_dir}")]
    Overlap {
        archive_dir: PathBuf,
        dataset_root: PathBuf,
    },

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupOutcome {
    /// The archive was extracted; `parts` is 0 when an unsplit archive was used.
    Extracted { parts: usize },
    AlreadyReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    NotPresent,
}

/// Where the archive bytes come from for one setup run.
enum ArchiveSource {
    Parts(Vec<ArchivePart>),
    Whole(PathBuf),
}

pub struct ArchiveManager {
    cfg: ArchiveConfig,
    dataset_root: PathBuf,
}

impl ArchiveManager {
    pub fn new(cfg: ArchiveConfig, dataset_root: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            dataset_root: dataset_root.into(),
        }
    }

    pub fn dataset_root(&self) -> &Path {
        &self.dataset_root
    }

    fn assembled_path(&self) -> PathBuf {
        self.cfg.dir.join(format!(".{}.assembled", self.cfg.name))
    }

    /// A hidden sibling of the dataset root, e.g. `.data.<suffix>-<uuid>`.
    fn sibling_path(&self, suffix: &str) -> Result<PathBuf, SetupError> {
        let root = resolve_path(&self.dataset_root);
        match (root.parent(), root.file_name()) {
            (Some(parent), Some(name)) => {
                let mut hidden = OsString::from(".");
                hidden.push(name);
                hidden.push(format!(".{suffix}-{}", Uuid::new_v4().simple()));
                Ok(parent.join(hidden))
            }
            _ => Err(SetupError::io(
                format!("dataset root {} has no parent", self.dataset_root.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            )),
        }
    }

    /// Whether the archive directory is the dataset root or lies beneath it.
    fn archive_inside_root(&self) -> bool {
        resolve_path(&self.cfg.dir).starts_with(resolve_path(&self.dataset_root))
    }

    async fn missing_under(&self, root: &Path) -> Vec<String> {
        let mut missing = Vec::new();
        for entry in &self.cfg.expected_entries {
            if !fs::try_exists(root.join(entry)).await.unwrap_or(false) {
                missing.push(entry.clone());
            }
        }
        missing
    }

    /// Expected top-level entries that are absent from the dataset root.
    pub async fn missing_entries(&self) -> Vec<String> {
        self.missing_under(&self.dataset_root).await
    }

    pub async fn is_ready(&self) -> bool {
        fs::try_exists(&self.dataset_root).await.unwrap_or(false)
            && self.missing_entries().await.is_empty()
    }

    async fn source(&self) -> Result<ArchiveSource, SetupError> {
        let parts =
            parts::locate_parts(&self.cfg.dir, &self.cfg.name, self.cfg.expected_parts).await?;
        if !parts.is_empty() {
            return Ok(ArchiveSource::Parts(parts));
        }

        let whole = self.cfg.dir.join(&self.cfg.name);
        if fs::try_exists(&whole).await.unwrap_or(false) && self.cfg.expected_parts.is_none() {
            return Ok(ArchiveSource::Whole(whole));
        }

        Err(SetupError::NoParts {
            dir: self.cfg.dir.clone(),
            name: self.cfg.name.clone(),
        })
    }

    /// Reassemble and extract the dataset unless it is already in place.
    ///
    /// An incomplete dataset root is replaced only after a complete extraction;
    /// on failure it is left untouched and nothing else remains behind.
    pub async fn setup(&self) -> Result<SetupOutcome, SetupError> {
        if self.archive_inside_root() {
            return Err(SetupError::Overlap {
                archive_dir: self.cfg.dir.clone(),
                dataset_root: self.dataset_root.clone(),
            });
        }

        if self.is_ready().await {
            info!(
                target: "archive",
                dataset_root = %self.dataset_root.display(),
                "dataset already extracted"
            );
            return Ok(SetupOutcome::AlreadyReady);
        }

        let source = self.source().await?;
        let staging = self.sibling_path("staging")?;

        let result = match self.extract_into(&source, &staging).await {
            Ok(parts) => self.swap_into_place(&staging).await.map(|()| parts),
            Err(e) => Err(e),
        };
        remove_quietly(&staging).await;

        let parts = result?;
        info!(
            target: "archive",
            dataset_root = %self.dataset_root.display(),
            parts,
            "dataset ready"
        );
        Ok(SetupOutcome::Extracted { parts })
    }

    /// Extract `source` into `staging` and check it holds every expected entry.
    async fn extract_into(
        &self,
        source: &ArchiveSource,
        staging: &Path,
    ) -> Result<usize, SetupError> {
        fs::create_dir_all(staging)
            .await
            .map_err(|e| SetupError::io(format!("creating {}", staging.display()), e))?;

        let parts = match source {
            ArchiveSource::Whole(archive) => {
                info!(target: "archive", archive = %archive.display(), "extracting unsplit archive");
                extract::extract(&self.cfg.tar_program, archive, staging).await?;
                0
            }
            ArchiveSource::Parts(parts) => {
                let assembled = self.assembled_path();
                let extracted = match parts::concatenate(parts, &assembled).await {
                    Ok(bytes) => {
                        info!(
                            target: "archive",
                            parts = parts.len(),
                            bytes,
                            "archive reassembled, extracting"
                        );
                        extract::extract(&self.cfg.tar_program, &assembled, staging).await
                    }
                    Err(e) => Err(e),
                };
                remove_quietly(&assembled).await;
                extracted?;
                parts.len()
            }
        };

        let missing = self.missing_under(staging).await;
        if !missing.is_empty() {
            return Err(SetupError::Incomplete { missing });
        }
        Ok(parts)
    }

    /// Move a complete staging tree to the dataset root, replacing an
    /// incomplete root if one exists. The old root is restored if the move fails.
    async fn swap_into_place(&self, staging: &Path) -> Result<(), SetupError> {
        let root = &self.dataset_root;
        let previous = if fs::try_exists(root).await.unwrap_or(false) {
            warn!(
                target: "archive",
                dataset_root = %root.display(),
                missing = ?self.missing_entries().await,
                "replacing incomplete dataset root"
            );
            let aside = self.sibling_path("previous")?;
            fs::rename(root, &aside)
                .await
                .map_err(|e| SetupError::io(format!("moving aside {}", root.display()), e))?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = fs::rename(staging, root).await {
            if let Some(aside) = &previous {
                if let Err(restore) = fs::rename(aside, root).await {
                    warn!(
                        target: "archive",
                        path = %aside.display(),
                        error = %restore,
                        "failed to restore previous dataset root"
                    );
                }
            }
            return Err(SetupError::io(
                format!("moving {} to {}", staging.display(), root.display()),
                e,
            ));
        }

        if let Some(aside) = previous {
            remove_quietly(&aside).await;
        }
        Ok(())
    }

    /// Remove the extracted dataset root. A missing root is not an error.
    pub async fn teardown(&self) -> Result<TeardownOutcome, TeardownError> {
        if self.archive_inside_root() {
            return Err(TeardownError::Overlap {
                archive_dir: self.cfg.dir.clone(),
                dataset_root: self.dataset_root.clone(),
            });
        }

        match fs::remove_dir_all(&self.dataset_root).await {
            Ok(()) => {
                info!(
                    target: "archive",
                    dataset_root = %self.dataset_root.display(),
                    "dataset removed"
                );
                Ok(TeardownOutcome::Removed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TeardownOutcome::NotPresent),
            Err(source) => Err(TeardownError::Remove {
                path: self.dataset_root.clone(),
                source,
            }),
        }
    }
}

/// Remove a file or directory this module created, logging anything but NotFound.
async fn remove_quietly(path: &Path) {
    let removed = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = removed {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                target: "archive",
                path = %path.display(),
                error = %e,
                "failed to clean up"
            );
        }
    }
}

/// Absolute, `.`/`..`-free form of `path`, with symlinks resolved for the part that exists.
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            let mut out = canonical;
            out.extend(rest.iter().rev());
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}
