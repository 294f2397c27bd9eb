//! Domain layer types.

pub mod record;
pub mod types;

pub use record::Record;
