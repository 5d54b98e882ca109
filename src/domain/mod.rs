//! Domain layer modules
//!
//! This module contains business domain logic:
//! - `metastore`: Message metadata storage and state transitions

pub mod metastore;
