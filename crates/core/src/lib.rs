pub mod config;
pub mod contact;
pub mod error;
pub mod event;
pub mod logging;
pub mod registry;

pub use error::{EventBusError, RegistryError, Result, TernError};
