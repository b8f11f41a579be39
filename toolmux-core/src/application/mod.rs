//! # Application Module
//!
//! Session and routing logic built on top of the transport and codec.
//!
//! ## Submodules
//!
//! - [`tooling`] - Per-server clients and the multi-server manager

pub mod tooling;
