pub mod engine;
pub mod memory;
pub mod persistence;
pub mod table;

pub use engine::{EventNotice, RunStore};
pub use memory::{JournaledStore, StoreStats};
pub use persistence::{DurabilityMode, PersistenceManager, WalEntry};
pub use table::TableSet;
