//! Rust client for the Geospatial Studio gateway, plus the pieces a map plugin needs to
//! turn inference outputs into map layers.
//!
//! The SDK side is [`Client`], which holds an [`InferenceClient`] for models, inference
//! runs, data sources and file shares, and a [`TuneClient`] for fine-tuning jobs, task
//! templates, datasets and base models. Request payloads in [`schema`] are validated
//! before anything is sent. Long-running jobs can be followed with the `poll_*` methods.
//!
//! ## Quick start
//! - Set `BASE_GATEWAY_API_URL` and `GEOSTUDIO_API_KEY` (or put them in
//!   `~/.geostudio_config_file`).
//! - Build a request and submit it.
//!
//! ```no_run
//! use anyhow::Result;
//! use geostudio::schema::{InferenceConfig, InferenceCreateInput, SpatialDomain};
//! use geostudio::{Client, Output};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!     let input = InferenceCreateInput {
//!         model_display_name: Some("flood-detection".into()),
//!         location: Some("Sacramento".into()),
//!         config: InferenceConfig {
//!             spatial_domain: SpatialDomain::from_bbox([-121.8, 38.4, -121.6, 38.6]),
//!             temporal_domain: Some(vec!["2024-08-01_2024-08-10".into()]),
//!             ..InferenceConfig::default()
//!         },
//!         ..InferenceCreateInput::default()
//!     };
//!     let created = client.inference.submit_inference(input, Output::Json)?.into_json()?;
//!     let id = created["id"].as_str().unwrap_or_default();
//!     client.inference.poll_inference_until_finished(id, Duration::from_secs(15))?;
//!     Ok(())
//! }
//! ```
//!
//! The [`plugin`] module is the map-plugin side: a small API wrapper that reports
//! failures as messages, and loaders that push rasters and WMS layers into a host
//! application through the [`plugin::MapHost`] trait.

#![forbid(unsafe_code)]

mod auth;
mod builder;
mod client;
mod config;
mod download;
mod error;
mod geo;
mod http;
mod inference;
pub mod plugin;
mod poll;
pub mod schema;
mod session;
mod table;
#[cfg(test)]
mod testing;
mod tune;
mod util;

pub use auth::{GrantType, IsvAuth};
pub use builder::{InferenceRequest, InferenceRequestBuilder};
pub use client::Client;
pub use config::{
    ClientOptions, Credentials, DataAdvisorDefaults, IsvSettings, PluginConfig, Settings,
    normalize_api_url,
};
pub use download::{Download, HttpDownloader};
pub use error::StudioError;
pub use geo::{geojson_to_bbox, list_archive_files};
pub use http::{BaseClient, FilePart, Formatted, Output, RawResponse};
pub use inference::{InferenceClient, task_status_table};
pub use poll::{JobKind, MIN_POLL_INTERVAL, Poller};
pub use session::Session;
pub use table::Table;
pub use tune::{
    MlflowUrls, TemplateOutput, TemplateTarget, TuneClient, TuningArtefact, tune_metrics_table,
};
