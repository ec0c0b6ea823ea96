pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::{DbPool, SqliteLedger};
