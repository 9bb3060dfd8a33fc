//! An HTTP/3 protocol engine for QUIC proxies.
//!
//! This crate implements the pieces between a QUIC transport and an HTTP
//! state machine: the frame codec, a per-stream frame dispatcher and
//! collector, QPACK header compression with a real dynamic table, and the
//! cooperative VIO plumbing that moves message bytes between the two.
//!
//! The engine core is synchronous and runtime-free, driven by "ready"
//! callbacks and a per-connection event queue; [`driver`] adds the async
//! glue for [`quinn`].
//!
//! What's deliberately *not* here: the QUIC transport itself, TLS, and the
//! HTTP semantics layer. Those are collaborators reached through the traits
//! and channels this crate exposes.

mod adapter;
mod buf;
mod collector;
mod config;
mod counter;
mod dispatcher;
mod enforcer;
mod error;
mod event;
mod frame;
mod hdr;
mod session;
mod settings;
mod stream;
mod transaction;
mod varint;
mod vio;

pub mod driver;
pub mod qpack;

pub use adapter::*;
pub use buf::*;
pub use collector::*;
pub use config::*;
pub use counter::*;
pub use dispatcher::*;
pub use enforcer::*;
pub use error::*;
pub use event::*;
pub use frame::*;
pub use hdr::*;
pub use session::*;
pub use settings::*;
pub use stream::*;
pub use transaction::*;
pub use varint::*;
pub use vio::*;

pub use qpack::{DecodeStatus, Qpack, QpackEvent};
