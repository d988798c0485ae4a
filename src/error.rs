use std::io;

use thiserror::Error;

use crate::wire::protocol::PacketType;

/// Umbrella error for every fallible high-level operation.
///
/// A [ConnectionError] on a single connection is handled inside the event
/// loop (the connection is reset and surviving connections keep serving the
/// call); the variants here are the ones that escape to the caller.
#[derive(Debug, Error)]
pub enum GearmanError {
    /// Bad host entry, incomplete TLS triple, admin with multiple hosts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Socket-level failure that could not be absorbed by the event loop.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No reachable server for a request.
    #[error("unable to reach any server: {0}")]
    ServerUnavailable(String),

    /// A request used up its connection attempt budget.
    #[error("request exhausted all {attempts} connection attempts")]
    ExceededConnectionAttempts { attempts: u32 },

    /// Malformed frame or response line.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A frame arrived that the client or worker state machine did not
    /// expect.
    #[error("invalid client state: {0}")]
    InvalidClientState(String),

    /// A line arrived (or a response was popped) when the admin state
    /// machine did not expect it.
    #[error("invalid admin client state: {0}")]
    InvalidAdminClientState(String),

    /// The server sent an ERROR frame.
    #[error("server error {code}: {text}")]
    Server { code: String, text: String },
}

/// A malformed frame, response line, or pack request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid magic bytes in header")]
    BadMagic,

    #[error("received a {received} magic, expected {expected}")]
    UnexpectedMagic {
        received: &'static str,
        expected: &'static str,
    },

    #[error("received unknown command {0}")]
    UnknownCommand(u32),

    #[error("{0} is not a binary command")]
    NotBinary(PacketType),

    #[error("{0} is not a text command")]
    NotText(PacketType),

    #[error("received {received} args, expected {expected} args for {kind}")]
    WrongArgCount {
        kind: PacketType,
        received: usize,
        expected: usize,
    },

    #[error("unexpected NUL byte in argument {param} of {kind}")]
    NullByteInArg {
        kind: PacketType,
        param: &'static str,
    },

    #[error("received NUL byte in text command")]
    NullByteInTextCommand,

    #[error("Received {received} tokens, expected {expected} tokens")]
    TokenCount { received: usize, expected: usize },

    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    #[error("{0:?} is not a known server command")]
    UnknownServerCommand(String),
}

/// A socket-level failure. Raising one of these resets the connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no socket set")]
    NoSocket,

    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
