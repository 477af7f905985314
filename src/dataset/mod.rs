//! The extracted dataset: two logical tables, each stored as any number of
//! Parquet partitions that are read as one table.
//!
//! Partition boundaries carry no meaning and may change between dataset
//! builds, so nothing here depends on how rows are spread across files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod models;
pub mod verify;

pub use models::{Market, MarketStatus, RecordViolation, Side, Trade};
pub use verify::{verify, TableCheck, VerifyReport};

/// File extension of every partition.
pub const PARTITION_EXTENSION: &str = "parquet";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("table {table} not found at {path} (run setup first)")]
    MissingTable { table: Table, path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error in {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("column {column} not found")]
    MissingColumn { column: String },

    #[error("column {column}: {reason}")]
    Column { column: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Markets,
    Trades,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Markets, Table::Trades];

    pub fn dir_name(self) -> &'static str {
        match self {
            Table::Markets => "markets",
            Table::Trades => "trades",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Clone, Debug)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: Table) -> PathBuf {
        self.root.join(table.dir_name())
    }

    /// Glob pattern that unions every partition of `table`, for SQL engines
    /// that read Parquet by pattern.
    pub fn glob(&self, table: Table) -> String {
        self.table_dir(table)
            .join(format!("*.{PARTITION_EXTENSION}"))
            .display()
            .to_string()
    }

    /// Every partition file of `table`, sorted by file name.
    pub fn partitions(&self, table: Table) -> Result<Vec<PathBuf>, DatasetError> {
        let dir = self.table_dir(table);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::MissingTable { table, path: dir })
            }
            Err(source) => {
                return Err(DatasetError::Io {
                    context: format!("listing {}", dir.display()),
                    source,
                })
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                context: format!("listing {}", dir.display()),
                source,
            })?;
            let path = entry.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(PARTITION_EXTENSION)
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
