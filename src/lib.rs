//! Typed RPC client and server for schema-defined callsets.
//!
//! A callset is a named, versioned group of operations. Calls are encoded
//! against the operation's argument schema into binary request frames, sent
//! over a single TCP connection, and correlated with their reply frames by
//! sequence number.

pub mod callsets;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod sequence;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{CallOptions, CallsetClient, Client};
pub use codec::Reply;
pub use config::{ClientConfig, ServerConfig};
pub use error::{RemoteError, Result, RpcError};
pub use protocol::{ReplyFrame, RequestFrame, Status, WireFrame};
pub use registry::{CallsetHandle, CallsetRegistry, ClosureHandler, HandlerRegistry, OperationHandler};
pub use schema::{CallsetDef, FieldSpec, OperationSpec};
pub use server::Server;
pub use transport::{Connection, Protocol};
pub use types::{Arguments, FieldType, Record, Value};
