//! Error types shared by the multiplexer core.

use std::io;

use thiserror::Error;

use crate::proxy::Xid;

/// Errors returned by mux configuration, registry and control-channel operations.
///
/// Datapath drops are never reported through this type; they only show up
/// in the link statistics.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid encapsulation: {0}")]
    InvalidEncap(u8),

    #[error("Unknown encapsulation: {0}")]
    UnknownEncap(String),

    #[error("Invalid proxy kind: {0:#x}")]
    InvalidKind(u8),

    #[error("Identifier {xid} cannot address a {kind} proxy")]
    InvalidXid { xid: Xid, kind: &'static str },

    #[error("Identifier already in use: {0}")]
    XidInUse(Xid),

    #[error("No proxy with identifier {0}")]
    UnknownXid(Xid),

    #[error("Uplink {0} is already attached")]
    UplinkBusy(String),

    #[error("Uplink {0} is a loopback device")]
    UplinkIsLoopback(String),

    #[error("Uplink table is full")]
    UplinkTableFull,

    #[error("Uplink {0} is not attached")]
    UplinkNotAttached(String),

    #[error("Failed to configure uplink {0}: {1}")]
    UplinkSetup(String, io::Error),

    #[error("Failed to read config {0}: {1}")]
    ConfigRead(String, io::Error),

    #[error("Invalid config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Named statistics table is full")]
    StatNamesFull,

    #[error("Failed to allocate a {0} byte message buffer")]
    NoBuffer(usize),

    #[error("Malformed control message: {0}")]
    Msg(#[from] crate::control::msg::MsgError),

    #[error("Device collaborator failed for {0}: {1}")]
    Device(String, io::Error),

    #[error("Control socket listen failed: {0}")]
    Listen(io::Error),

    #[error("Control socket accept failed: {0}")]
    Accept(io::Error),

    #[error("Control socket receive failed: {0}")]
    Recv(io::Error),

    #[error("Control channel service is already running")]
    AlreadyRunning,

    #[error("Failed to spawn control channel service: {0}")]
    Spawn(io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;
