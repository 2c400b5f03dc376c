//! Binary artifact storage with debounced package repository rebuilds.
//!
//! Build systems push binaries addressed by project, distro, distro
//! version, architecture, and ref; this crate records them in a resource
//! hierarchy, stores their bytes, and keeps Debian- and RPM-style package
//! repositories synchronized by collapsing bursts of uploads into
//! debounced, idempotent rebuild tasks that invoke the external indexing
//! tools.

#![deny(missing_docs)]

pub mod builder;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod paths;
pub mod scheduler;
pub mod store;
