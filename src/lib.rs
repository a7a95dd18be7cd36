//! # labwire
//!
//! Uniform access to laboratory instruments whether they sit on local hardware or
//! behind a remote channel broker, plus a typed Parent/Child protocol for building
//! composite instrument trees (a GPIB-over-serial controller hosting a mainframe
//! hosting plug-in modules) from declarative configuration.
//!
//! ## Layers
//!
//! - [`descriptor`]: canonical strings addressing a channel (`serial:`, `visa:`,
//!   `http(s)://`, `dummy:`).
//! - [`backend`]: transports implementing the open/close/write/read/readline contract.
//! - [`broker`]: descriptor → backend cache with at-most-one backend per descriptor,
//!   usable in-process or over HTTP/JSON RPC.
//! - [`deps`]: capability objects a parent hands to a child so it can reach its
//!   channel without touching backend details.
//! - [`tree`]: Params sum type, capacity validation, registry and cascade teardown.
//! - [`instrument`]: concrete instrument nodes built on the layers above.
//!
//! Ambient modules: [`error`], [`config`], [`logging`] and [`codec`].

pub mod backend;
pub mod broker;
pub mod codec;
pub mod config;
pub mod deps;
pub mod descriptor;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod tree;

pub use broker::{ChannelBroker, ChannelHandle};
pub use descriptor::{parse_descriptor, Descriptor};
pub use error::{AppResult, LabError};
pub use tree::{Instrument, InstrumentRegistry, Params, Parent, ParentExt};
