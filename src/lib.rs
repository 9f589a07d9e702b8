//! HTTP front end for an external media extraction engine.
//!
//! Looks up metadata, resolves direct stream URLs and serves transcoded
//! downloads out of a scratch directory that is reclaimed in the background.

pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod routes;

pub use config::Config;
pub use engine::{Engine, EngineError, MediaKind, MediaMetadata, Quality, YtDlp};
pub use error::ApiError;
pub use files::{DownloadJob, FileManager, JobId, RetentionPolicy};
pub use routes::{AppState, build_router};
