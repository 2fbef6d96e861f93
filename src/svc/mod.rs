//! # Services module
//!
//! This module provide services to provision aurora databases through aws,
//! patch kubernetes workloads and helpers to do so.
pub mod cfg;
pub mod deprovisioner;
pub mod flow;
pub mod k8s;
pub mod patcher;
pub mod poll;
pub mod postgres;
pub mod provisioner;
pub mod rds;
pub mod record;
pub mod telemetry;
