//! Stage 1 - tile registration.
//!
//! Resolves the acquisition's mosaic, creates (or finds) the tile's
//! metadata row and associates the resolved camera configuration. The
//! result goes back to the controller over the job's single-use channel;
//! a failed registration never advances to content storage.

use crate::notify::Notifier;
use crate::pipeline::{IngestError, JobProcessor, RegistrationJob, RegistrationResult};
use crate::store::{MetadataStore, RegisteredTile};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Stage-1 job processor.
pub struct RegistrationProcessor {
    metadata: Arc<dyn MetadataStore>,
    notifier: Arc<dyn Notifier>,
}

impl RegistrationProcessor {
    pub fn new(metadata: Arc<dyn MetadataStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { metadata, notifier }
    }

    async fn register(&self, job: &RegistrationJob) -> Result<RegisteredTile, IngestError> {
        let mosaic = self
            .metadata
            .get_mosaic(job.acq_id)
            .await
            .map_err(IngestError::MetadataUnavailable)?;

        let mut tile = self
            .metadata
            .create_or_get_tile(&mosaic, job.params.col, job.params.row, job.params.frame)
            .await
            .map_err(IngestError::MetadataUnavailable)?;

        // Camera configuration is best effort: a missing configuration is
        // logged and the tile registers without one.
        match self.metadata.camera_config(mosaic.temca_id, job.params.camera).await {
            Ok(config) => {
                if tile.camera_config.is_none() {
                    self.metadata
                        .update_tile_camera(tile.tile_id, &config)
                        .await
                        .map_err(IngestError::MetadataUnavailable)?;
                }
                tile.camera_config = Some(config);
            }
            Err(e) => {
                warn!(
                    acq_id = job.acq_id,
                    camera = job.params.camera,
                    error = %e,
                    "ignoring camera configuration error"
                );
            }
        }

        Ok(tile)
    }
}

impl JobProcessor for RegistrationProcessor {
    type Job = RegistrationJob;

    async fn process(&self, job: RegistrationJob) {
        let local_start = Instant::now();
        debug!(
            job_id = %job.id,
            acq_id = job.acq_id,
            tile = %job.params.name,
            bytes = job.content_len,
            "begin tile registration"
        );

        let result: RegistrationResult = self.register(&job).await;

        match &result {
            Ok(tile) => info!(
                job_id = %job.id,
                acq_id = job.acq_id,
                tile = %job.params.name,
                tile_id = tile.tile_id,
                stage_ms = local_start.elapsed().as_millis() as u64,
                total_ms = job.elapsed().as_millis() as u64,
                "successfully registered tile"
            ),
            Err(e) => {
                info!(
                    job_id = %job.id,
                    acq_id = job.acq_id,
                    tile = %job.params.name,
                    error = %e,
                    stage_ms = local_start.elapsed().as_millis() as u64,
                    "error encountered while registering tile"
                );
                self.notifier.notify(&e.to_string(), false).await;
            }
        }

        if job.result_tx.send(result).is_err() {
            debug!(acq_id = job.acq_id, "registration result dropped by caller");
        }
    }
}
