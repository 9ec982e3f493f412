//! glbc-operator: global load balancing for Ingresses placed across kcp workload clusters

pub mod cluster;
pub mod config;
pub mod controllers;
pub mod dns;
pub mod health;
pub mod metrics;
pub mod object;
pub mod placement;
pub mod status;
pub mod telemetry;
pub mod tls;
pub mod writeback;

pub use config::{Args, Settings};
pub use controllers::ControllerContext;
