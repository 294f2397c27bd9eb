//! Remote table clients.

mod memory;
mod postgrest;

pub use memory::MemoryTableClient;
pub use postgrest::PostgrestClient;
