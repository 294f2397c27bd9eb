//! Application layer: query model, table access, events and entity services.

pub mod accessor;
pub mod entity;
pub mod error;
pub mod events;
pub mod query;
pub mod registry;
pub mod store;
