//! # microproto-core
//!
//! Wire format and data model of the MicroProto property-sync protocol.
//!
//! - **Wire primitives**: [`wire::OpHeader`], varints, [`wire::WireReader`]
//! - **Value model**: [`types::PropertyType`], [`types::Value`] tagged union
//! - **Schema**: [`schema::PropertyDef`] and `SCHEMA_UPSERT` encode/decode
//! - **Messages**: HELLO, PING/PONG, ERROR, PROPERTY_UPDATE_SHORT
//! - **Errors**: [`error::ProtoError`] and on-wire [`error::ErrorCode`]s
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by every other microproto crate.

#![deny(unsafe_code)]

pub mod error;
pub mod ids;
pub mod messages;
pub mod schema;
pub mod types;
pub mod wire;

pub use error::{ErrorCode, ProtoError};
pub use ids::{ClientId, SessionId};
pub use schema::PropertyDef;
pub use types::{PropertyType, Scalar, ScalarType, Value};
