//! Mountpoint Pod attachment operator

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Pod controller and sweeper wiring
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
