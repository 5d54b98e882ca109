// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::metrics;
pub use infrastructure::postgres;

// Configuration
pub mod config;

// Domain layer (business logic)
pub mod domain;

pub use domain::metastore;

// Supporting modules
pub mod telemetry;
