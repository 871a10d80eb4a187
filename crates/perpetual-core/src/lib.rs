pub mod batch;
pub mod config;
pub mod error;
pub mod lock;
pub mod registry;
pub mod store;
pub mod sync;
pub mod task;
pub mod types;

pub use error::{PerpetualError, Result};
