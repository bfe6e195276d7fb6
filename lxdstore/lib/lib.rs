//! `lxdstore` is a client library for an LXD-like container hypervisor, with an
//! in-memory implementation for tests and local development.

#![warn(missing_docs)]

mod error;
mod event;
mod memory;
mod object;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use event::*;
pub use memory::*;
pub use object::*;
pub use store::*;
