#![warn(clippy::unwrap_used)]

pub mod rest;
pub mod server;

pub use server::{install_metrics_recorder, ApiServer};
