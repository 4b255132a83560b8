// =============================================================================
// Persistence — storage boundary and the background pattern writer
// =============================================================================

pub mod store;
pub mod writer;

pub use store::{JsonFileStore, MemoryStore, Store};
pub use writer::{run_writer, PatternQueue, PatternWriter, PersistJob};
