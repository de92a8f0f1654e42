//! Temp-file spill for crash tolerance.
//!
//! Every accepted tile is written to `<tmp_data_dir>/<acqID>/<tile-name>`
//! before it enters the registration queue and the file is removed only
//! after content storage succeeds. A spill file that survives a process
//! restart marks a tile whose metadata may or may not be registered;
//! replaying those files is an operator task, but the naming convention is
//! part of the contract.

use crate::pipeline::IngestError;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};

/// Writes a tile's content to its spill path, creating parent directories.
pub async fn write_spill(
    tmp_data_dir: &Path,
    acq_id: u64,
    name: &str,
    content: &[u8],
) -> Result<PathBuf, IngestError> {
    let start = Instant::now();
    let full_path = tmp_data_dir.join(acq_id.to_string()).join(name);

    let parent = full_path.parent().unwrap_or(tmp_data_dir);
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| IngestError::SpillFailure {
            path: parent.display().to_string(),
            source,
        })?;

    tokio::fs::write(&full_path, content)
        .await
        .map_err(|source| IngestError::SpillFailure {
            path: full_path.display().to_string(),
            source,
        })?;

    debug!(
        path = %full_path.display(),
        bytes = content.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "created temporary tile file"
    );
    Ok(full_path)
}

/// Removes a spill file after successful content storage.
///
/// A missing file is logged and tolerated; anything else is logged as an
/// error but never fails the job, since the content is already durable.
pub async fn remove_spill(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed temporary tile file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "temporary tile file not found")
        }
        Err(e) => error!(path = %path.display(), error = %e, "error deleting temporary tile file"),
    }
}
