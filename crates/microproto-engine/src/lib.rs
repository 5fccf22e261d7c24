//! # microproto-engine
//!
//! Property registry, constraint validation and the update/broadcast engine.
//!
//! The engine runs as one task ([`handle::spawn`]) that owns the registry and
//! the set of established sessions. Connections talk to it through an
//! [`EngineHandle`]; accepted updates are fanned out over each session's
//! bounded outbound queue, and a session whose queue is full is dropped
//! rather than blocking the engine. In-process code can follow every
//! committed change through [`EngineHandle::subscribe`].

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod validate;

pub use engine::{
    EngineConfig, Handshake, Origin, Outcome, PropertyChange, PropertySnapshot, UpdateEngine,
};
pub use error::EngineError;
pub use handle::{spawn, EngineHandle};
pub use registry::{PropertyEntry, PropertyRegistry};
