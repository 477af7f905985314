use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default location of the harness configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Working directory of every analysis unit. Units reach the dataset and
    /// output directories through fixed relative paths from here.
    pub project_root: PathBuf,
    pub dataset_root: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            dataset_root: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding the compressed archive parts.
    pub dir: PathBuf,
    /// Archive file name; parts are named `<name>.part<N>`.
    pub name: String,
    /// When set, the number of parts found must match exactly.
    pub expected_parts: Option<usize>,
    /// Top-level entries that must exist under the dataset root for it to count as ready.
    pub expected_entries: Vec<String>,
    pub tar_program: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            name: "data.tar.zst".to_string(),
            expected_parts: None,
            expected_entries: vec!["markets".to_string(), "trades".to_string()],
            tar_program: "tar".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Directory scanned for analysis units.
    pub dir: PathBuf,
    /// Recognized unit suffix without the leading dot. `None` accepts any file.
    pub extension: Option<String>,
    /// Program (plus leading args) used to run each unit. `None` executes the file directly.
    pub interpreter: Option<Vec<String>>,
    /// File name prefixes that are never treated as units.
    pub skip_prefixes: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("analysis"),
            extension: Some("py".to_string()),
            interpreter: Some(vec!["python3".to_string()]),
            skip_prefixes: vec!["_".to_string(), ".".to_string()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum simultaneously running units. Defaults to host parallelism.
    pub concurrency: Option<usize>,
    pub write_report: bool,
    /// Seconds between progress log records during a batch; 0 disables them.
    pub progress_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            write_report: true,
            progress_interval_secs: 30,
        }
    }
}

impl RunnerConfig {
    /// Effective concurrency bound, never below one.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency
            .unwrap_or_else(default_concurrency)
            .max(1)
    }
}

/// Number of processing units available to this process.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "pm_analysis=info,harness=info,archive=info,runner=info,dataset=info,metrics=info"
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub paths: PathsConfig,
    pub archive: ArchiveConfig,
    pub analysis: AnalysisConfig,
    pub runner: RunnerConfig,
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let cfg: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to deserialize TOML config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Load the configuration for the CLI.
    ///
    /// An explicitly requested file must exist. The default location is optional and
    /// falls back to built-in defaults when absent.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_config_keeps_defaults() {
        let toml = r#"
            [paths]
            dataset_root = "/srv/pm/data"

            [archive]
            name = "snapshot.tar.gz"
            expected_parts = 4

            [analysis]
            extension = "sh"

            [runner]
            concurrency = 3
        "#;

        let cfg: HarnessConfig = toml::from_str(toml).expect("failed to parse harness config");
        assert_eq!(cfg.paths.dataset_root, PathBuf::from("/srv/pm/data"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("output"));
        assert_eq!(cfg.archive.name, "snapshot.tar.gz");
        assert_eq!(cfg.archive.expected_parts, Some(4));
        assert_eq!(cfg.archive.expected_entries, vec!["markets", "trades"]);
        assert_eq!(cfg.analysis.extension.as_deref(), Some("sh"));
        assert_eq!(cfg.analysis.interpreter, Some(vec!["python3".to_string()]));
        assert_eq!(cfg.runner.concurrency_limit(), 3);
        assert!(cfg.runner.write_report);
    }

    #[test]
    fn empty_config_is_default() {
        let cfg: HarnessConfig = toml::from_str("").expect("empty config");
        assert_eq!(cfg.archive.tar_program, "tar");
        assert!(!cfg.logging.json);
        assert!(cfg.runner.concurrency_limit() >= 1);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let runner = RunnerConfig {
            concurrency: Some(0),
            ..RunnerConfig::default()
        };
        assert_eq!(runner.concurrency_limit(), 1);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = HarnessConfig::load(Some(Path::new("/nonexistent/harness.toml")))
            .expect_err("explicit config must exist");
        assert!(err.to_string().contains("/nonexistent/harness.toml"));
    }
}
