//! Two-stage tile ingestion pipeline.
//!
//! ```text
//! Transport -> Codec -> Controller -> Spill -> Stage 1 -> Response
//!                                                |
//!                                                v
//!                                             Stage 2 (async)
//! ```
//!
//! Stage 1 registers the tile's metadata row; the response is emitted as
//! soon as it completes so the microscope can step to the next tile.
//! Stage 2 makes the content durable behind the response; its failures
//! surface on a later response through the bounded async error channel.
//! Both stages run on bounded worker pools whose queue depths drive the
//! GREEN/YELLOW/RED backpressure triple attached to every response.
//!
//! # Key Components
//!
//! - [`IngestController`] - orchestrates one tile's journey
//! - [`RegistrationProcessor`] - stage-1 work (mosaic, tile row, camera)
//! - [`ContentStoreProcessor`] - stage-2 decorated storage chain
//! - [`PoolHandle`] - bounded admission into a stage's worker pool
//! - [`StatusTriple`] - the backpressure triple

mod content;
mod controller;
mod dispatcher;
mod error;
mod job;
mod registration;
pub mod spill;
mod status;

pub use content::{
    build_content_chain, AsyncErrors, ContentProcessor, ContentResult, ContentStoreProcessor,
    DEFAULT_RETRIES,
};
pub use controller::{IngestController, IngestOutcome};
pub use dispatcher::{start as start_pool, JobProcessor, PoolHandle};
pub use error::IngestError;
pub use job::{ContentJob, JobId, RegistrationJob, RegistrationResult};
pub use registration::RegistrationProcessor;
pub use status::{QueueStatus, StatusTriple};
