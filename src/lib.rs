//! Table access, TTL cache overlays and entity services for the site content
//! tables.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
