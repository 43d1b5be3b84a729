//! Prometheus exporter for DSMR/P1 smart-meter readings.
//!
//! Decoded telegrams flow through an ingestion loop into a fixed set of
//! metric cells; the HTTP endpoint renders whatever values are current at
//! scrape time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ TelegramSource  │────>│    Ingestor     │────>│   MetricState   │
//! │ (stream, demo)  │     │ (mapping table) │     │ (atomic gauges) │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//!                                                 ┌────────▼────────┐
//!                                                 │   HTTP Server   │
//!                                                 │   (/metrics)    │
//!                                                 └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! p1-decoder /dev/ttyUSB0 | p1-exporter --device -
//! p1-exporter --demo --listen-address 127.0.0.1:9832
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod ingest;
pub mod lifecycle;
pub mod mapping;
pub mod source;
pub mod state;

pub use config::{ExporterConfig, SourceConfig};
pub use http::{BoundServer, HttpServer};
pub use ingest::{IngestHandle, IngestOutcome, Ingestor};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use mapping::{MappingTable, MetricKey, MetricName};
pub use source::{DemoSource, LineSource, SourceError, TelegramSource};
pub use state::{MetricState, SharedState};
