//! Script Discovery: enumerates the analysis units in one directory and resolves
//! user-supplied identifiers to exactly one of them.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

use crate::runner::{RunContext, Runnable};
use crate::types::AnalysisConfig;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no analysis named {identifier:?}{}", format_suggestions(.suggestions))]
    NotFound {
        identifier: String,
        suggestions: Vec<String>,
    },

    #[error("analysis name {identifier:?} is ambiguous: matches {candidates:?}")]
    Ambiguous {
        identifier: String,
        candidates: Vec<String>,
    },

    #[error("failed to scan analysis directory {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

/// An executable analysis script found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptUnit {
    pub name: String,
    pub path: PathBuf,
    interpreter: Vec<String>,
}

impl ScriptUnit {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, interpreter: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            interpreter,
        }
    }
}

impl Runnable for ScriptUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, _ctx: &RunContext) -> Command {
        // Units run from the project root, so resolve the script path before the
        // working directory changes underneath a relative path.
        let script = if self.path.is_absolute() {
            self.path.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.path))
                .unwrap_or_else(|_| self.path.clone())
        };

        match self.interpreter.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(&script);
                cmd
            }
            None => Command::new(&script),
        }
    }
}

pub struct ScriptDiscovery {
    dir: PathBuf,
    extension: Option<String>,
    interpreter: Vec<String>,
    skip_prefixes: Vec<String>,
}

impl ScriptDiscovery {
    pub fn new(cfg: &AnalysisConfig) -> Self {
        Self {
            dir: cfg.dir.clone(),
            extension: cfg
                .extension
                .as_ref()
                .map(|e| e.trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty()),
            interpreter: cfg.interpreter.clone().unwrap_or_default(),
            skip_prefixes: cfg.skip_prefixes.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Unit name for a directory entry, or `None` if the file is not a unit.
    fn unit_name(&self, file_name: &str) -> Option<String> {
        if self
            .skip_prefixes
            .iter()
            .any(|p| !p.is_empty() && file_name.starts_with(p.as_str()))
        {
            return None;
        }

        let path = Path::new(file_name);
        match &self.extension {
            Some(ext) => {
                if path.extension().and_then(|e| e.to_str()) != Some(ext.as_str()) {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            }
            None => Some(file_name.to_string()),
        }
    }

    fn scan(&self) -> Result<Vec<ScriptUnit>, DiscoveryError> {
        let io_err = |source| DiscoveryError::Io {
            dir: self.dir.clone(),
            source,
        };

        let mut units = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            // Follows symlinks; a dangling link is not a unit.
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(e)),
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = self.unit_name(file_name) {
                units.push(ScriptUnit::new(name, entry.path(), self.interpreter.clone()));
            }
        }

        units.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        Ok(units)
    }

    /// All units in the directory, ordered by name.
    ///
    /// Each call rescans the directory, so the sequence can be restarted by calling again.
    pub fn list_all(&self) -> Result<impl Iterator<Item = ScriptUnit>, DiscoveryError> {
        Ok(self.scan()?.into_iter())
    }

    /// Resolve a name, with or without the recognized suffix, to exactly one unit.
    ///
    /// An exact name wins. Otherwise a prefix shared by exactly one unit is accepted;
    /// a prefix shared by several is rejected as ambiguous.
    pub fn resolve(&self, identifier: &str) -> Result<ScriptUnit, DiscoveryError> {
        let wanted = self.strip_suffix(identifier.trim());
        let units = self.scan()?;

        let exact: Vec<&ScriptUnit> = units.iter().filter(|u| u.name == wanted).collect();
        match exact.as_slice() {
            [unit] => return Ok((*unit).clone()),
            [] => {}
            many => {
                return Err(DiscoveryError::Ambiguous {
                    identifier: identifier.to_string(),
                    candidates: many.iter().map(|u| u.path.display().to_string()).collect(),
                })
            }
        }

        let prefixed: Vec<&ScriptUnit> = if wanted.is_empty() {
            Vec::new()
        } else {
            units.iter().filter(|u| u.name.starts_with(wanted)).collect()
        };
        match prefixed.as_slice() {
            [unit] => Ok((*unit).clone()),
            [] => Err(DiscoveryError::NotFound {
                identifier: identifier.to_string(),
                suggestions: suggestions(wanted, &units),
            }),
            many => Err(DiscoveryError::Ambiguous {
                identifier: identifier.to_string(),
                candidates: many.iter().map(|u| u.name.clone()).collect(),
            }),
        }
    }

    fn strip_suffix<'a>(&self, identifier: &'a str) -> &'a str {
        let identifier = Path::new(identifier)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(identifier);
        match &self.extension {
            Some(ext) => identifier
                .strip_suffix(ext.as_str())
                .and_then(|s| s.strip_suffix('.'))
                .unwrap_or(identifier),
            None => identifier,
        }
    }
}

/// Unit names that contain the wanted text, for "did you mean" hints.
fn suggestions(wanted: &str, units: &[ScriptUnit]) -> Vec<String> {
    if wanted.len() < 3 {
        return Vec::new();
    }
    let needle = wanted.to_ascii_lowercase();
    units
        .iter()
        .filter(|u| u.name.to_ascii_lowercase().contains(&needle))
        .map(|u| u.name.clone())
        .take(5)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery(extension: Option<&str>) -> ScriptDiscovery {
        ScriptDiscovery::new(&AnalysisConfig {
            dir: PathBuf::from("analysis"),
            extension: extension.map(str::to_string),
            interpreter: None,
            skip_prefixes: vec!["_".to_string(), ".".to_string()],
        })
    }

    #[test]
    fn unit_names_respect_extension_and_prefixes() {
        let d = discovery(Some(".py"));
        assert_eq!(d.unit_name("win_rate.py").as_deref(), Some("win_rate"));
        assert_eq!(d.unit_name("__init__.py"), None);
        assert_eq!(d.unit_name(".hidden.py"), None);
        assert_eq!(d.unit_name("notes.txt"), None);
        assert_eq!(d.unit_name("README"), None);

        let any = discovery(None);
        assert_eq!(any.unit_name("run_me").as_deref(), Some("run_me"));
        assert_eq!(any.unit_name("_skip"), None);
    }

    #[test]
    fn strips_recognized_suffix_only() {
        let d = discovery(Some("py"));
        assert_eq!(d.strip_suffix("volume.py"), "volume");
        assert_eq!(d.strip_suffix("volume"), "volume");
        assert_eq!(d.strip_suffix("analysis/volume.py"), "volume");
        assert_eq!(d.strip_suffix("volume.sh"), "volume.sh");
        assert_eq!(d.strip_suffix("happy"), "happy");
    }

    #[test]
    fn suggestions_need_some_overlap() {
        let units = vec![
            ScriptUnit::new("maker_taker_returns", "a", vec![]),
            ScriptUnit::new("taker_volume", "b", vec![]),
            ScriptUnit::new("calibration", "c", vec![]),
        ];
        assert_eq!(
            suggestions("taker", &units),
            vec!["maker_taker_returns", "taker_volume"]
        );
        assert!(suggestions("zz", &units).is_empty());
    }

    #[test]
    fn not_found_message_lists_suggestions() {
        let err = DiscoveryError::NotFound {
            identifier: "volum".to_string(),
            suggestions: vec!["volume_by_hour".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no analysis named \"volum\" (did you mean: volume_by_hour?)"
        );
    }
}
