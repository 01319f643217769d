//! Host system information

pub mod resources;

pub use resources::{get_resource_usage, ResourceUsage};
