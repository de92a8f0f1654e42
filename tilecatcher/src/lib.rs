//! TileCatcher - ingestion core for electron-microscopy tile capture.
//!
//! Microscope cameras stream raw TIFF tiles at ~150ms intervals, across up
//! to four cameras per acquisition. This library accepts each tile over a
//! dual transport (a length-prefixed binary socket protocol and an HTTP
//! surface), runs it through a two-stage pipeline (metadata registration,
//! then durable content storage) and reports live backpressure on every
//! response so the microscope can throttle before loss occurs.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilecatcher::config::Settings;
//! use tilecatcher::notify::LogNotifier;
//! use tilecatcher::pipeline::IngestController;
//! use tilecatcher::server::{HttpServer, TcpServer};
//! use tilecatcher::store::memory::{MemoryBlobStore, MemoryMetadataStore};
//!
//! let settings = Settings::from_ini_file("tilecatcher.ini")?;
//! let controller = IngestController::start(
//!     &settings,
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(MemoryBlobStore::new()),
//!     Arc::new(LogNotifier),
//! )?;
//!
//! let tcp = TcpServer::bind("0.0.0.0:16000", &settings, Arc::clone(&controller)).await?;
//! tokio::spawn(tcp.run());
//! HttpServer::bind("0.0.0.0:5001", &settings, controller).await?.run().await?;
//! ```

pub mod codec;
pub mod config;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod tile;

/// Version of the tilecatcher library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
