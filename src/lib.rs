//! An RFC 6455 WebSocket server core.
//!
//! `wavecore` implements the server half of the protocol: the HTTP
//! Upgrade handshake, frame (de)coding, fragmentation and control-frame
//! handling, the session state machine (ping/pong, close handshake), and
//! a session manager/dispatcher for addressing connected clients. It is
//! deliberately server-only: client behavior, permessage-deflate, and
//! anything above the WebSocket layer (routing, auth) are out of scope.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod server;
pub mod session;
pub mod transport;
