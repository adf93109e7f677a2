//! Device polling collector
//!
//! Polls network devices over SNMP and writes the results to InfluxDB, with the
//! work distributed through a `collector_queue` job queue.
//!
//! - [`config`] - Environment configuration
//! - [`snmp`] - Net-SNMP command line client
//! - [`transform`] - Value normalization and point building
//! - [`influx`] - Line protocol writer
//! - [`poll`] - The per-job work function
//! - [`supervisor`] - Wiring, signals and shutdown

pub mod config;
pub mod influx;
pub mod poll;
pub mod snmp;
pub mod supervisor;
pub mod telemetry;
pub mod transform;

pub use config::{BackendKind, ConfigError, ServiceConfig};
pub use poll::{DeviceJob, DevicePoller};
pub use supervisor::{install_signal_handlers, Supervisor, SupervisorError};
