//! Core library for the `meteo` weather sampler.
//!
//! This crate defines:
//! - Configuration handling
//! - The upstream weather provider and response normalization
//! - The SQLite sample store and durable job queue
//! - The fetch pipeline, its background workers and cron scheduler
//! - The HTTP router exposing fetch and latest-sample endpoints
//!
//! It is used by `meteo-cli`, but can also be embedded by other binaries.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod worker;

pub use config::{Config, FetchMode};
pub use db::Database;
pub use error::{FetchError, QueueError, StoreError};
pub use model::{FetchJob, NewSample, SampleView, WeatherSample};
pub use pipeline::FetchPipeline;
pub use provider::{OpenMeteoProvider, WeatherProvider};
pub use queue::{JobQueue, SqliteJobQueue};
pub use store::{SampleStore, SqliteSampleStore};
pub use worker::Worker;
