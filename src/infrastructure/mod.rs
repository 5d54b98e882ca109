//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool

pub mod metrics;
pub mod postgres;
