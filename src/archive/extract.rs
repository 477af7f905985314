use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::SetupError;

/// Unpack `archive` into `dest` with the system tar.
///
/// Compression is detected by tar from the archive contents.
pub async fn extract(tar_program: &str, archive: &Path, dest: &Path) -> Result<(), SetupError> {
    debug!(
        target: "archive",
        program = %tar_program,
        archive = %archive.display(),
        dest = %dest.display(),
        "running extractor"
    );

    let output = Command::new(tar_program)
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SetupError::io(format!("starting {tar_program}"), e))?;

    if !output.status.success() {
        return Err(SetupError::Extract {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
