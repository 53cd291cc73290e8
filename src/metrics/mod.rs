//! In-process metric store and its Prometheus text rendering.

pub mod exposition;
pub mod registry;

pub use exposition::{encode, render};
pub use registry::{MetricRegistry, MetricSnapshot, RegistryCell, get_or_create_registry, reset};
