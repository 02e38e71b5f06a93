//! Key-Value Storage subsystem
//!
//! - `value`: typed values and their payload encoding
//! - `record`: the record body stored in each copy
//! - `journal`: all-or-nothing commits
//! - `storage`: the public [`KeyValueStorage`]

mod journal;
mod record;
mod storage;
mod value;

pub use record::{GenerationClock, KvsRecord};
pub use storage::KeyValueStorage;
pub use value::{KvsType, KvsValue, ValueType};
