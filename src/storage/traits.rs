//! Capability interface of the key-value store under test
//!
//! The engine never talks to a concrete product. It needs plain reads and
//! writes, conditional writes for coordination between writers on different
//! machines, and optionally transactions and a change stream.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use super::codec::CodecError;

/// Errors that can occur during store operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store (or the node serving this key) cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete in time; it may or may not have been applied
    #[error("store operation timed out")]
    Timeout,
    /// A transaction could not commit because a concurrent write won
    #[error("transaction conflict on key {0}")]
    Conflict(String),
    /// The store lacks the requested capability
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// A stored value could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A key that was created or updated, as seen by a change-stream subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub value: Vec<u8>,
}

/// Key-value store abstraction
///
/// Values are opaque bytes. Conditional operations compare byte-for-byte,
/// which is why every value the engine writes has a canonical encoding.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the current value of a key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally write a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Write the value only if the key holds nothing
    /// Returns true if the write happened
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Compare-and-swap: write `value` only if the key currently holds `expected`
    async fn replace(&self, key: &str, expected: &[u8], value: Vec<u8>)
        -> Result<bool, StoreError>;

    /// Remove the key only if it currently holds `expected`
    async fn remove(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Whether `begin` is supported
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Open a transaction. Operations on the returned handle are applied
    /// all-or-nothing on commit.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Err(StoreError::Unsupported("transactions"))
    }

    /// Subscribe to created/updated keys, if the store can report them
    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        None
    }
}

/// An open transaction
///
/// Reads observe the transaction's own writes. Dropping the handle without
/// committing discards everything staged in it.
#[async_trait]
pub trait StoreTransaction: KeyValueStore {
    /// View this transaction as a plain store
    fn as_store(&self) -> &dyn KeyValueStore;

    /// Apply every staged write atomically
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every staged write
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
