use bytes::Bytes;

use crate::error::{GearmanError, ProtocolError};
use crate::net::connection::Connection;
use crate::wire::protocol::Packet;

pub mod admin;
pub mod client;
pub mod worker;

pub use admin::AdminHandler;
pub use client::ClientHandler;
pub use worker::WorkerHandler;

/// Per-connection protocol state machine for one role.
///
/// The event loop owns the connection; a handler only ever touches it
/// through the `&mut Connection` it is handed, and only to queue outgoing
/// commands. Dispatch from opcode to behavior is a static `match` inside
/// `recv_packet`.
pub trait CommandHandler {
    /// Replays role state onto a freshly (re-)established connection.
    fn on_connect(&mut self, conn: &mut Connection)
        -> Result<(), GearmanError>;

    /// The connection was reset; drop per-connection expectations.
    fn on_disconnect(&mut self);

    /// Handles one inbound frame, possibly queueing replies.
    fn recv_packet(
        &mut self,
        conn: &mut Connection,
        packet: Packet,
    ) -> Result<(), GearmanError>;
}

/// Surfaces a server ERROR frame to the caller of the running operation.
pub(crate) fn server_error(packet: &Packet) -> GearmanError {
    let (code, text) = match packet.expect_args::<2>() {
        Ok([code, text]) => (lossy(code), lossy(text)),
        Err(_) => (String::from("?"), String::from("?")),
    };

    GearmanError::Server { code, text }
}

pub(crate) fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses an ASCII decimal field of a frame or response line.
pub(crate) fn ascii_u64(
    bytes: &[u8],
    what: &str,
) -> Result<u64, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::MalformedResponse(format!(
                "expected a decimal {what}, got {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// Parses the `0`/`1` flags of a STATUS_RES frame.
pub(crate) fn ascii_flag(bytes: &[u8]) -> bool {
    bytes == b"1"
}
