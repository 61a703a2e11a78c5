pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod model;
pub mod surface;

pub use error::{EventBusError, Result, SabycomError};
