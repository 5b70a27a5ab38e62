//! Store abstraction consumed by the engine
//!
//! - `traits`: the capability interface (`KeyValueStore`, `StoreTransaction`)
//! - `codec`: value encoding
//! - `memory`: in-process implementation for tests and demos

pub mod codec;
pub mod memory;
pub mod traits;

pub use codec::CodecError;
pub use memory::MemoryStore;
pub use traits::{KeyValueStore, StoreError, StoreEvent, StoreTransaction};
