//! Transport abstractions for beacon.
//!
//! Sessions only depend on the async [`adapter::Transport`] contract and the
//! event stream it feeds. [`memory::InMemoryTransport`] is the scripted
//! double used by tests and simulations.

pub mod adapter;
pub mod memory;

pub use adapter::{
    Transport, TransportError, TransportEvent, TransportEventSink, TransportFuture,
    TransportHealthSnapshot,
};
pub use memory::{route_presence_updates, route_published_locations, InMemoryTransport};
