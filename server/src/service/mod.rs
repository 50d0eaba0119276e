//! Services exposed by the reference server

mod registry;

pub use registry::ServiceRegistry;
