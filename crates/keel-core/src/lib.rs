//! Core infrastructure for the Keel module runtime.
//!
//! Modules are registered into named containers through a
//! [`ModuleRegistry`](registry::ModuleRegistry), declare what they depend on
//! while being constructed, talk to each other through typed events, and
//! persist their state into versioned project documents. A
//! [`Runtime`](runtime::Runtime) owns one of each manager.

pub mod container;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod key;
pub mod logging;
pub mod module;
pub mod registry;
pub mod requires;
pub mod runtime;
pub mod serialization;
pub mod state;
pub mod tick;

#[cfg(test)]
mod testing;

pub use error::{ErrorKind, Result, RuntimeError};
pub use runtime::Runtime;
