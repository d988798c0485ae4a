use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, ReadBuf,
    Ready,
};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ConnectionError, ProtocolError};
use crate::wire::decoder::{parse_binary_packet, parse_text_packet};
use crate::wire::encoder::{pack_binary_packet, pack_text_packet};
use crate::wire::protocol::{Packet, PacketType, NULL_BYTE};

/// The port gearmand listens on by default.
pub const DEFAULT_PORT: u16 = 4730;

/// Upper bound on bytes pulled off the socket per readable event.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One TCP (optionally TLS) link to one Gearman server.
///
/// Commands pass through two stages on the way out: `send_command` queues a
/// [Packet], `send_commands_to_buffer` serialises the queue onto the
/// outgoing byte buffer, and `send_data_to_socket` writes as much of that
/// buffer as the socket accepts. Inbound, `read_data_from_socket` appends a
/// chunk to the incoming buffer and `read_commands_from_buffer` parses
/// every complete frame out of it. The event loop owns when each stage
/// runs; nothing here blocks outside the two socket calls.
#[derive(Debug)]
pub struct Connection {
    host: String,
    port: u16,
    keyfile: Option<PathBuf>,
    certfile: Option<PathBuf>,
    ca_certs: Option<PathBuf>,
    stream: Option<Stream>,
    connected: bool,
    outgoing_commands: VecDeque<Packet>,
    outgoing_buffer: BytesMut,
    incoming_buffer: BytesMut,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            stream: None,
            connected: false,
            outgoing_commands: VecDeque::new(),
            outgoing_buffer: BytesMut::new(),
            incoming_buffer: BytesMut::new(),
        }
    }

    /// Supplies the client TLS file paths. TLS engages iff all three are
    /// present.
    pub fn with_tls_files(
        mut self,
        keyfile: Option<PathBuf>,
        certfile: Option<PathBuf>,
        ca_certs: Option<PathBuf>,
    ) -> Self {
        self.keyfile = keyfile;
        self.certfile = certfile;
        self.ca_certs = ca_certs;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_ssl(&self) -> bool {
        self.keyfile.is_some()
            && self.certfile.is_some()
            && self.ca_certs.is_some()
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Establishes the socket if not already connected, wrapping it in TLS
    /// when the full file triple is configured. Failure leaves the
    /// connection disconnected.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.connected {
            return Ok(());
        }

        let result = self.connect_stream().await;
        match result {
            Ok(stream) => {
                debug!(host = %self.host, port = self.port, "connected");
                self.stream = Some(stream);
                self.connected = true;
                Ok(())
            },
            Err(error) => {
                self.reset();
                Err(error)
            },
        }
    }

    async fn connect_stream(&self) -> Result<Stream, ConnectionError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;

        if !self.use_ssl() {
            return Ok(Stream::Tcp(tcp));
        }

        // use_ssl() established that all three paths are present.
        let connector = tls_connector(
            self.keyfile.as_deref().unwrap(),
            self.certfile.as_deref().unwrap(),
            self.ca_certs.as_deref().unwrap(),
        )?;
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = connector.connect(server_name, tcp).await?;

        Ok(Stream::Tls(Box::new(tls)))
    }

    /// Waits for the underlying socket to become ready for `interest`.
    /// Fails when no socket is set.
    pub async fn ready(
        &self,
        interest: Interest,
    ) -> Result<Ready, ConnectionError> {
        let stream = self.stream.as_ref().ok_or(ConnectionError::NoSocket)?;
        Ok(stream.ready(interest).await?)
    }

    /// Appends a command to the outgoing queue without touching the
    /// socket.
    pub fn send_command(&mut self, packet: Packet) {
        self.outgoing_commands.push_back(packet);
    }

    /// Drains the command queue, serialising each frame onto the outgoing
    /// byte buffer.
    pub fn send_commands_to_buffer(&mut self) -> Result<(), ProtocolError> {
        while let Some(packet) = self.outgoing_commands.pop_front() {
            if packet.kind == PacketType::TextCommand {
                pack_text_packet(&packet, &mut self.outgoing_buffer)?;
            } else {
                pack_binary_packet(&packet, false, &mut self.outgoing_buffer)?;
            }
        }

        Ok(())
    }

    /// Writes as much of the outgoing buffer as the socket accepts,
    /// trimming what was written. Returns the byte count.
    pub async fn send_data_to_socket(
        &mut self,
    ) -> Result<usize, ConnectionError> {
        if self.outgoing_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().ok_or(ConnectionError::NoSocket)?;
        let n = stream.write_buf(&mut self.outgoing_buffer).await?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }

        Ok(n)
    }

    /// Reads up to one chunk from the socket into the incoming buffer.
    /// A clean EOF is connection loss.
    pub async fn read_data_from_socket(
        &mut self,
    ) -> Result<usize, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NoSocket)?;

        self.incoming_buffer.reserve(READ_CHUNK_SIZE);
        let n = stream.read_buf(&mut self.incoming_buffer).await?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }

        Ok(n)
    }

    /// Parses every complete frame out of the incoming buffer, leaving any
    /// partial frame in place for the next read.
    pub fn read_commands_from_buffer(
        &mut self,
    ) -> Result<Vec<Packet>, ProtocolError> {
        let mut packets = Vec::new();

        loop {
            let parsed = if self.incoming_buffer.is_empty() {
                None
            } else if self.incoming_buffer[0] == NULL_BYTE {
                parse_binary_packet(&mut self.incoming_buffer, true)?
            } else {
                parse_text_packet(&mut self.incoming_buffer)?
            };

            match parsed {
                Some(packet) => packets.push(packet),
                None => return Ok(packets),
            }
        }
    }

    /// Commands queued by `send_command` but not yet serialised.
    pub(crate) fn queued_commands(&self) -> &VecDeque<Packet> {
        &self.outgoing_commands
    }

    /// Whether any outbound bytes or queued commands await the socket;
    /// drives the poller's write interest.
    pub fn has_pending_output(&self) -> bool {
        !self.outgoing_buffer.is_empty() || !self.outgoing_commands.is_empty()
    }

    /// Closes the socket and discards every buffer and queued command.
    pub fn reset(&mut self) {
        // Dropping the stream closes the socket; close errors are moot.
        self.stream = None;
        self.connected = false;
        self.outgoing_commands.clear();
        self.outgoing_buffer.clear();
        self.incoming_buffer.clear();
    }
}

#[cfg(test)]
impl Connection {
    /// A connection that believes it is live, for state-machine tests
    /// that never touch a socket.
    pub(crate) fn connected_for_tests(host: &str) -> Self {
        let mut conn = Self::new(host, DEFAULT_PORT);
        conn.connected = true;
        conn
    }

    pub(crate) fn clear_queued(&mut self) {
        self.outgoing_commands.clear();
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(s) => s,
            Stream::Tls(s) => s.get_ref().0,
        }
    }

    /// Readiness of the underlying socket. For TLS this is transport
    /// readiness; a readable socket may still hold only part of a record,
    /// in which case the following read simply waits for the remainder.
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.tcp().ready(interest).await
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Builds a client TLS connector from the three PEM paths: trusted roots
/// from `ca_certs`, client auth from `certfile` + `keyfile`.
fn tls_connector(
    keyfile: &Path,
    certfile: &Path,
    ca_certs: &Path,
) -> Result<TlsConnector, ConnectionError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(ca_certs)?))
    {
        roots
            .add(cert?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(
        certfile,
    )?))
    .collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(
        keyfile,
    )?))?
    .ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no private key in keyfile")
    })?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsConnector::from(Arc::new(config)))
}
