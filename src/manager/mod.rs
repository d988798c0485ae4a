use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::GearmanError;
use crate::handler::CommandHandler;
use crate::net::connection::{Connection, DEFAULT_PORT};
use crate::net::poller::Poller;

pub mod admin;
pub mod client;
pub mod worker;

/// One server endpoint a manager should talk to.
///
/// Parses from `"host"` or `"host:port"`, converts from `(host, port)`,
/// or builds explicitly when the TLS file triple is needed. The TLS paths
/// obey an all-or-none rule, checked when a manager adopts the spec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub ca_certs: Option<PathBuf>,
}

impl ServerSpec {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            keyfile: None,
            certfile: None,
            ca_certs: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls(
        mut self,
        keyfile: impl Into<PathBuf>,
        certfile: impl Into<PathBuf>,
        ca_certs: impl Into<PathBuf>,
    ) -> Self {
        self.keyfile = Some(keyfile.into());
        self.certfile = Some(certfile.into());
        self.ca_certs = Some(ca_certs.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), GearmanError> {
        if self.host.is_empty() {
            return Err(GearmanError::InvalidConfiguration(String::from(
                "server host must not be empty",
            )));
        }

        let present = [&self.keyfile, &self.certfile, &self.ca_certs]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if present != 0 && present != 3 {
            return Err(GearmanError::InvalidConfiguration(String::from(
                "keyfile, certfile, and ca_certs must be provided together",
            )));
        }

        Ok(())
    }

    pub(crate) fn into_connection(self) -> Connection {
        Connection::new(self.host, self.port).with_tls_files(
            self.keyfile,
            self.certfile,
            self.ca_certs,
        )
    }
}

impl FromStr for ServerSpec {
    type Err = GearmanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    GearmanError::InvalidConfiguration(format!(
                        "invalid port in server entry {s:?}"
                    ))
                })?;
                Ok(ServerSpec::new(host).port(port))
            },
            None => Ok(ServerSpec::new(s)),
        }
    }
}

impl From<(&str, u16)> for ServerSpec {
    fn from((host, port): (&str, u16)) -> Self {
        ServerSpec::new(host).port(port)
    }
}

/// How much of a caller's deadline is left.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Remaining {
    Unbounded,
    Within(Duration),
    Expired,
}

impl Remaining {
    pub fn is_expired(self) -> bool {
        self == Remaining::Expired
    }

    /// The bound to thread into the next poll call.
    pub fn as_poll_timeout(self) -> Option<Duration> {
        match self {
            Remaining::Unbounded => None,
            Remaining::Within(t) => Some(t),
            Remaining::Expired => Some(Duration::ZERO),
        }
    }
}

pub(crate) fn deadline_after(poll_timeout: Option<Duration>) -> Option<Instant> {
    poll_timeout.map(|t| Instant::now() + t)
}

pub(crate) fn remaining(deadline: Option<Instant>) -> Remaining {
    match deadline {
        None => Remaining::Unbounded,
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Remaining::Expired
            } else {
                Remaining::Within(deadline - now)
            }
        },
    }
}

/// A connection paired with its role handler.
pub(crate) struct Endpoint<H> {
    pub connection: Connection,
    pub handler: H,
}

/// The connection set shared by every manager role: owns the endpoints
/// and the poller, and runs one step of the event loop at a time.
pub(crate) struct Pool<H> {
    pub endpoints: Vec<Endpoint<H>>,
    pub poller: Poller,
}

impl<H: CommandHandler> Pool<H> {
    pub fn new(
        specs: impl IntoIterator<Item = ServerSpec>,
        make_handler: impl Fn() -> H,
    ) -> Result<Self, GearmanError> {
        let mut endpoints = Vec::new();
        for spec in specs {
            spec.validate()?;
            endpoints.push(Endpoint {
                connection: spec.into_connection(),
                handler: make_handler(),
            });
        }

        Ok(Self { endpoints, poller: Poller::new() })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.connection.connected())
            .count()
    }

    /// Connects the endpoint if needed and replays handler state onto it.
    pub async fn establish(&mut self, idx: usize) -> Result<(), GearmanError> {
        let ep = &mut self.endpoints[idx];
        if ep.connection.connected() {
            return Ok(());
        }

        ep.connection.connect().await?;
        ep.handler.on_connect(&mut ep.connection)
    }

    /// Localizes a connection failure: reset the connection, notify the
    /// handler, forget the poller registration. Surviving connections
    /// keep serving the call.
    pub fn handle_error(&mut self, idx: usize) {
        let ep = &mut self.endpoints[idx];
        warn!(
            host = %ep.connection.host(),
            port = ep.connection.port(),
            "resetting connection after error"
        );
        ep.connection.reset();
        ep.handler.on_disconnect();
        self.poller.unregister(idx);
    }

    fn flush_to_buffers(&mut self) -> Result<(), GearmanError> {
        for ep in &mut self.endpoints {
            if ep.connection.connected() {
                ep.connection.send_commands_to_buffer()?;
            }
        }

        Ok(())
    }

    /// One step of the event loop: serialise queued commands, wait for
    /// readiness bounded by `poll_timeout`, then read, parse, dispatch,
    /// and flush per readiness. Returns whether anything happened.
    ///
    /// Connection-level failures are absorbed here; protocol and state
    /// machine errors propagate to the caller of the running operation.
    pub async fn poll_once(
        &mut self,
        poll_timeout: Option<Duration>,
    ) -> Result<bool, GearmanError> {
        self.flush_to_buffers()?;

        let mut any_live = false;
        for (idx, ep) in self.endpoints.iter().enumerate() {
            if ep.connection.connected() {
                self.poller.modify(
                    idx,
                    true,
                    ep.connection.has_pending_output(),
                );
                any_live = true;
            } else {
                self.poller.unregister(idx);
            }
        }
        if !any_live {
            return Err(GearmanError::ServerUnavailable(String::from(
                "no server connections are live",
            )));
        }

        let events = {
            let conns: Vec<&Connection> =
                self.endpoints.iter().map(|e| &e.connection).collect();
            self.poller.poll(&conns, poll_timeout).await
        };
        let activity = !events.is_empty();

        for &idx in &events.errored {
            self.handle_error(idx);
        }

        for &idx in &events.writable {
            if !self.endpoints[idx].connection.connected() {
                continue;
            }
            if let Err(error) =
                self.endpoints[idx].connection.send_data_to_socket().await
            {
                debug!(%error, "write failed");
                self.handle_error(idx);
            }
        }

        for &idx in &events.readable {
            if !self.endpoints[idx].connection.connected() {
                continue;
            }
            if let Err(error) =
                self.endpoints[idx].connection.read_data_from_socket().await
            {
                debug!(%error, "read failed");
                self.handle_error(idx);
                continue;
            }

            let packets =
                self.endpoints[idx].connection.read_commands_from_buffer()?;
            for packet in packets {
                let ep = &mut self.endpoints[idx];
                ep.handler.recv_packet(&mut ep.connection, packet)?;
            }
        }

        Ok(activity)
    }
}
