use serde::Serialize;
use tracing::info;

use crate::types::HarnessConfig;

#[derive(Serialize)]
struct StartupLog<'a> {
    event: &'a str,
    command: &'a str,
    dataset_root: String,
    output_dir: String,
    analysis_dir: String,
    archive: String,
    concurrency: usize,
}

pub fn log_startup(cfg: &HarnessConfig, command: &str) {
    let payload = StartupLog {
        event: "startup",
        command,
        dataset_root: cfg.paths.dataset_root.display().to_string(),
        output_dir: cfg.paths.output_dir.display().to_string(),
        analysis_dir: cfg.analysis.dir.display().to_string(),
        archive: cfg.archive.dir.join(&cfg.archive.name).display().to_string(),
        concurrency: cfg.runner.concurrency_limit(),
    };
    info!(target: "harness", startup = serde_json::to_string(&payload).unwrap_or_default().as_str());
}
