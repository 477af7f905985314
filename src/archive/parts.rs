use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};

use super::SetupError;

/// One numbered piece of a split archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivePart {
    pub index: u32,
    pub path: PathBuf,
}

/// Parse the part index out of a file name of the form `<archive_name>.part<N>`.
pub fn part_index(file_name: &str, archive_name: &str) -> Option<u32> {
    let digits = file_name
        .strip_prefix(archive_name)?
        .strip_prefix(".part")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sort parts by index and check that the sequence has no holes.
///
/// A sequence may start at 0 or 1. When `expected` is set the number of parts must match.
pub fn order_parts(
    mut parts: Vec<ArchivePart>,
    expected: Option<usize>,
) -> Result<Vec<ArchivePart>, SetupError> {
    parts.sort_by_key(|p| p.index);

    if let Some(first) = parts.first() {
        if first.index > 1 {
            return Err(SetupError::MissingPart {
                index: first.index - 1,
            });
        }
    }

    for pair in parts.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.index == prev.index {
            return Err(SetupError::DuplicatePart { index: next.index });
        }
        if next.index != prev.index + 1 {
            return Err(SetupError::MissingPart {
                index: prev.index + 1,
            });
        }
    }

    if let Some(expected) = expected {
        if parts.len() != expected {
            return Err(SetupError::PartCountMismatch {
                expected,
                found: parts.len(),
            });
        }
    }

    Ok(parts)
}

/// Find every part of `archive_name` in `dir`, in index order.
pub async fn locate_parts(
    dir: &Path,
    archive_name: &str,
    expected: Option<usize>,
) -> Result<Vec<ArchivePart>, SetupError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| SetupError::io(format!("listing {}", dir.display()), e))?;

    let mut parts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SetupError::io(format!("listing {}", dir.display()), e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = part_index(name, archive_name) {
            parts.push(ArchivePart {
                index,
                path: entry.path(),
            });
        }
    }

    order_parts(parts, expected)
}

/// Concatenate `parts` in order into a single file at `dest`, returning the bytes written.
pub async fn concatenate(parts: &[ArchivePart], dest: &Path) -> Result<u64, SetupError> {
    let mut out = File::create(dest)
        .await
        .map_err(|e| SetupError::io(format!("creating {}", dest.display()), e))?;

    let mut total = 0u64;
    for part in parts {
        let mut input = File::open(&part.path)
            .await
            .map_err(|e| SetupError::io(format!("opening {}", part.path.display()), e))?;
        total += io::copy(&mut input, &mut out)
            .await
            .map_err(|e| SetupError::io(format!("appending {}", part.path.display()), e))?;
    }

    out.flush()
        .await
        .map_err(|e| SetupError::io(format!("flushing {}", dest.display()), e))?;
    Ok(total)
}
