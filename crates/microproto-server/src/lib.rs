//! # microproto-server
//!
//! WebSocket transport for the MicroProto engine. Each binary WebSocket
//! message is one protocol frame. Connections run a [`session::SessionMachine`]
//! and talk to the engine task through its handle; idle clients are swept
//! on a timer.

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod server;
pub mod session;

pub use client::ClientRegistry;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{Action, SessionMachine, SessionState};
