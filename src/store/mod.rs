//! Durable key/value storage for driver session state.

pub mod driver_store;
pub mod file;
pub mod memory;

use crate::error::AppError;

pub use driver_store::{DriverStore, PersistedState};
pub use file::FileStore;
pub use memory::MemoryStore;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    fn set(&self, key: &str, value: &str) -> Result<(), AppError>;
    fn remove(&self, key: &str) -> Result<(), AppError>;
    fn remove_prefix(&self, prefix: &str) -> Result<(), AppError>;
}
