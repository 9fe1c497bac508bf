//! Connection module
//!
//! Everything that touches the wire: the protobuf messages, the gRPC
//! client, transport setup and the authentication exchange.

pub mod grpc;
pub mod handshake;
pub mod protocol;
pub mod transport;
