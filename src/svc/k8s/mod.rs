//! # Kubernetes module
//!
//! This module provide helpers to read workloads, patch them in place and
//! persist resource records as config maps

pub mod client;
pub mod resource;
pub mod workload;
