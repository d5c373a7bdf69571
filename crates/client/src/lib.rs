//! Per-account connection loops for Tern.
//!
//! A [`ConnectionCore`] owns one account's stream and drives the router,
//! presence engine, session store and PGP worker from a single task.
//! Front ends talk to it through a [`CoreHandle`] and listen on the event
//! bus.

mod command;
mod error;

#[cfg(feature = "native")]
mod connection;
#[cfg(feature = "native")]
mod context;
#[cfg(feature = "native")]
mod handlers;
#[cfg(feature = "native")]
mod outgoing;
#[cfg(feature = "native")]
mod responses;

pub use command::Command;
pub use error::ClientError;

#[cfg(feature = "native")]
pub use connection::{Client, ConnectionCore, CoreHandle, CoreServices};

#[cfg(not(feature = "native"))]
compile_error!("tern-client requires the `native` feature.");
