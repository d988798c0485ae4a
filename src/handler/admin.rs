use std::collections::VecDeque;
use std::fmt;
use std::mem;

use bytes::Bytes;
use serde::Serialize;

use super::{ascii_u64, lossy, server_error, CommandHandler};
use crate::error::{GearmanError, ProtocolError};
use crate::net::connection::Connection;
use crate::wire::protocol::{Packet, PacketType};

/// The payload `ping_server` bounces off ECHO_REQ.
pub const ECHO_STRING: &[u8] = b"ping? pong!";

/// The textual server commands this handler can correlate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminCommand {
    Status,
    Workers,
    Version,
    MaxQueue,
    Shutdown,
    GetPid,
    CancelJob,
    ShowJobs,
    ShowUniqueJobs,
    /// Binary ECHO_REQ correlated through the same FIFO.
    Echo,
}

impl AdminCommand {
    /// Matches a raw command line against the allow-list by verb prefix.
    pub fn from_command_line(line: &str) -> Option<Self> {
        use AdminCommand::*;

        // Longest verbs first: "show unique jobs" shadows "show jobs".
        const VERBS: &[(&str, AdminCommand)] = &[
            ("show unique jobs", ShowUniqueJobs),
            ("show jobs", ShowJobs),
            ("cancel job", CancelJob),
            ("maxqueue", MaxQueue),
            ("shutdown", Shutdown),
            ("workers", Workers),
            ("version", Version),
            ("status", Status),
            ("getpid", GetPid),
        ];

        VERBS
            .iter()
            .find(|(verb, _)| line.starts_with(verb))
            .map(|&(_, cmd)| cmd)
    }

    /// Commands the server never answers; their response is synthesized.
    fn has_no_reply(self) -> bool {
        matches!(
            self,
            AdminCommand::Shutdown
                | AdminCommand::GetPid
                | AdminCommand::CancelJob
        )
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AdminCommand::*;

        f.write_str(match self {
            Status => "status",
            Workers => "workers",
            Version => "version",
            MaxQueue => "maxqueue",
            Shutdown => "shutdown",
            GetPid => "getpid",
            CancelJob => "cancel job",
            ShowJobs => "show jobs",
            ShowUniqueJobs => "show unique jobs",
            Echo => "echo",
        })
    }
}

/// One record of a `status` reply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StatusEntry {
    pub task: String,
    pub queued: u64,
    pub running: u64,
    pub workers: u64,
}

/// One record of a `workers` reply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WorkerEntry {
    pub file_descriptor: String,
    pub ip: String,
    pub client_id: String,
    pub tasks: Vec<String>,
}

/// One record of a `show jobs` reply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobEntry {
    pub handle: String,
    pub queued: u64,
    pub canceled: u64,
    pub enabled: u64,
}

/// A fully accumulated admin reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdminResponse {
    Status(Vec<StatusEntry>),
    Workers(Vec<WorkerEntry>),
    Version(String),
    MaxQueue,
    Jobs(Vec<JobEntry>),
    UniqueJobs(Vec<String>),
    Echo(Bytes),
    /// Synthesized for commands the server does not answer.
    Empty,
}

/// Admin-role state machine for one connection.
///
/// Replies on the text channel carry no command identifier, so the front
/// of the sent-command FIFO decides what each line means. Multi-line
/// replies accumulate until the `.` terminator, then move to the response
/// FIFO that `pop_response` drains in lockstep with the sent FIFO.
#[derive(Debug, Default)]
pub struct AdminHandler {
    sent_commands: VecDeque<AdminCommand>,
    recv_responses: VecDeque<(AdminCommand, AdminResponse)>,
    status_acc: Vec<StatusEntry>,
    workers_acc: Vec<WorkerEntry>,
    jobs_acc: Vec<JobEntry>,
    unique_jobs_acc: Vec<String>,
}

impl AdminHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a command line against the allow-list, queues it on the
    /// wire with its newline terminator, and records it for correlation.
    pub fn send_text_command(
        &mut self,
        conn: &mut Connection,
        command_line: &str,
    ) -> Result<AdminCommand, ProtocolError> {
        let command = AdminCommand::from_command_line(command_line)
            .ok_or_else(|| {
                ProtocolError::UnknownServerCommand(command_line.to_owned())
            })?;

        conn.send_command(Packet::text(Bytes::from(format!(
            "{command_line}\n"
        ))));
        self.sent_commands.push_back(command);

        if command.has_no_reply() {
            self.recv_responses.push_back((command, AdminResponse::Empty));
        }

        Ok(command)
    }

    /// Queues an ECHO_REQ, correlated like a text command.
    pub fn send_echo_request(&mut self, conn: &mut Connection, data: Bytes) {
        conn.send_command(Packet::new(PacketType::EchoReq, vec![data]));
        self.sent_commands.push_back(AdminCommand::Echo);
    }

    /// True once at least one complete reply awaits `pop_response`.
    pub fn response_ready(&self) -> bool {
        !self.recv_responses.is_empty()
    }

    /// Pops the oldest complete reply with the command that caused it.
    pub fn pop_response(
        &mut self,
    ) -> Result<(AdminCommand, AdminResponse), GearmanError> {
        let Some((command, response)) = self.recv_responses.pop_front() else {
            return Err(GearmanError::InvalidAdminClientState(String::from(
                "no admin response is ready to pop",
            )));
        };
        self.sent_commands.pop_front();

        Ok((command, response))
    }

    fn finish(&mut self, command: AdminCommand, response: AdminResponse) {
        self.recv_responses.push_back((command, response));
    }

    fn recv_text_line(&mut self, raw: &Bytes) -> Result<(), GearmanError> {
        let Some(&command) = self.sent_commands.front() else {
            return Err(GearmanError::InvalidAdminClientState(String::from(
                "received a server response with no outstanding command",
            )));
        };

        let line = lossy(raw);
        match command {
            AdminCommand::Status => {
                if line == "." {
                    let entries = mem::take(&mut self.status_acc);
                    self.finish(command, AdminResponse::Status(entries));
                } else {
                    let entry = parse_status_line(&line)?;
                    self.status_acc.push(entry);
                }
            },
            AdminCommand::Workers => {
                if line == "." {
                    let entries = mem::take(&mut self.workers_acc);
                    self.finish(command, AdminResponse::Workers(entries));
                } else {
                    let entry = parse_workers_line(&line)?;
                    self.workers_acc.push(entry);
                }
            },
            AdminCommand::ShowJobs => {
                if line == "." {
                    let entries = mem::take(&mut self.jobs_acc);
                    self.finish(command, AdminResponse::Jobs(entries));
                } else {
                    let entry = parse_jobs_line(&line)?;
                    self.jobs_acc.push(entry);
                }
            },
            AdminCommand::ShowUniqueJobs => {
                if line == "." {
                    let entries = mem::take(&mut self.unique_jobs_acc);
                    self.finish(command, AdminResponse::UniqueJobs(entries));
                } else {
                    self.unique_jobs_acc.push(line);
                }
            },
            AdminCommand::Version => {
                self.finish(command, AdminResponse::Version(line));
            },
            AdminCommand::MaxQueue => {
                if line != "OK" {
                    return Err(ProtocolError::MalformedResponse(format!(
                        "expected OK, received: {line}"
                    ))
                    .into());
                }
                self.finish(command, AdminResponse::MaxQueue);
            },
            AdminCommand::Shutdown
            | AdminCommand::GetPid
            | AdminCommand::CancelJob
            | AdminCommand::Echo => {
                return Err(GearmanError::InvalidAdminClientState(format!(
                    "unexpected response line for {command}"
                )));
            },
        }

        Ok(())
    }

    fn recv_echo_res(&mut self, data: Bytes) -> Result<(), GearmanError> {
        match self.sent_commands.front() {
            Some(AdminCommand::Echo) => {
                self.finish(AdminCommand::Echo, AdminResponse::Echo(data));
                Ok(())
            },
            _ => Err(GearmanError::InvalidAdminClientState(String::from(
                "received ECHO_RES with no echo request outstanding",
            ))),
        }
    }
}

impl CommandHandler for AdminHandler {
    fn on_connect(
        &mut self,
        _conn: &mut Connection,
    ) -> Result<(), GearmanError> {
        Ok(())
    }

    fn on_disconnect(&mut self) {
        self.sent_commands.clear();
        self.recv_responses.clear();
        self.status_acc.clear();
        self.workers_acc.clear();
        self.jobs_acc.clear();
        self.unique_jobs_acc.clear();
    }

    fn recv_packet(
        &mut self,
        _conn: &mut Connection,
        packet: Packet,
    ) -> Result<(), GearmanError> {
        match packet.kind {
            PacketType::TextCommand => {
                let [raw_text] = packet.expect_args::<1>()?;
                self.recv_text_line(raw_text)
            },
            PacketType::EchoRes => {
                let [data] = packet.expect_args::<1>()?;
                self.recv_echo_res(data.clone())
            },
            PacketType::Error => Err(server_error(&packet)),
            kind => Err(GearmanError::InvalidAdminClientState(format!(
                "admin client received unexpected {kind}"
            ))),
        }
    }
}

fn expect_tokens<'a>(
    line: &'a str,
    separator: char,
    expected: usize,
) -> Result<Vec<&'a str>, ProtocolError> {
    let tokens: Vec<&str> = line.split(separator).collect();
    if tokens.len() != expected {
        return Err(ProtocolError::TokenCount {
            received: tokens.len(),
            expected,
        });
    }

    Ok(tokens)
}

// "task\tqueued\trunning\tworkers"
fn parse_status_line(line: &str) -> Result<StatusEntry, ProtocolError> {
    let tokens = expect_tokens(line, '\t', 4)?;

    Ok(StatusEntry {
        task: tokens[0].to_owned(),
        queued: ascii_u64(tokens[1].as_bytes(), "queued count")?,
        running: ascii_u64(tokens[2].as_bytes(), "running count")?,
        workers: ascii_u64(tokens[3].as_bytes(), "worker count")?,
    })
}

// "fd ip client_id : task task…"
fn parse_workers_line(line: &str) -> Result<WorkerEntry, ProtocolError> {
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() < 4 {
        return Err(ProtocolError::MalformedResponse(format!(
            "workers line holds {} tokens, expected at least 4",
            tokens.len()
        )));
    }
    if tokens[3] != ":" {
        return Err(ProtocolError::MalformedResponse(format!(
            "workers line separator is {:?}, expected \":\"",
            tokens[3]
        )));
    }

    Ok(WorkerEntry {
        file_descriptor: tokens[0].to_owned(),
        ip: tokens[1].to_owned(),
        client_id: tokens[2].to_owned(),
        tasks: tokens[4..].iter().map(|&t| t.to_owned()).collect(),
    })
}

// "handle\tqueued\tcanceled\tenabled"
fn parse_jobs_line(line: &str) -> Result<JobEntry, ProtocolError> {
    let tokens = expect_tokens(line, '\t', 4)?;

    Ok(JobEntry {
        handle: tokens[0].to_owned(),
        queued: ascii_u64(tokens[1].as_bytes(), "queued count")?,
        canceled: ascii_u64(tokens[2].as_bytes(), "canceled count")?,
        enabled: ascii_u64(tokens[3].as_bytes(), "enabled count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        conn: Connection,
        handler: AdminHandler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conn: Connection::connected_for_tests("localhost"),
                handler: AdminHandler::new(),
            }
        }

        fn send(&mut self, command_line: &str) -> AdminCommand {
            let command = self
                .handler
                .send_text_command(&mut self.conn, command_line)
                .unwrap();

            let queued = self.conn.queued_commands().back().unwrap();
            assert_eq!(queued.kind, PacketType::TextCommand);
            assert_eq!(
                queued.args[0],
                Bytes::from(format!("{command_line}\n"))
            );

            command
        }

        fn recv_line(&mut self, line: &str) -> Result<(), GearmanError> {
            self.handler.recv_packet(
                &mut self.conn,
                Packet::text(Bytes::from(line.to_owned())),
            )
        }

        fn pop(&mut self, expected: AdminCommand) -> AdminResponse {
            let (command, response) = self.handler.pop_response().unwrap();
            assert_eq!(command, expected);
            response
        }
    }

    #[test]
    fn test_send_illegal_server_command() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.handler
                .send_text_command(&mut fx.conn, "This is not a server command"),
            Err(ProtocolError::UnknownServerCommand(_))
        ));
    }

    #[test]
    fn test_ping_round_trip() {
        let mut fx = Fixture::new();
        fx.handler
            .send_echo_request(&mut fx.conn, Bytes::from_static(ECHO_STRING));
        assert_eq!(
            fx.conn.queued_commands().back().unwrap().kind,
            PacketType::EchoReq
        );

        fx.handler
            .recv_packet(
                &mut fx.conn,
                Packet::new(
                    PacketType::EchoRes,
                    vec![Bytes::from_static(ECHO_STRING)],
                ),
            )
            .unwrap();

        let response = fx.pop(AdminCommand::Echo);
        assert_eq!(
            response,
            AdminResponse::Echo(Bytes::from_static(ECHO_STRING))
        );
    }

    #[test]
    fn test_unexpected_echo_res() {
        let mut fx = Fixture::new();
        let result = fx.handler.recv_packet(
            &mut fx.conn,
            Packet::new(PacketType::EchoRes, vec![Bytes::new()]),
        );
        assert!(matches!(
            result,
            Err(GearmanError::InvalidAdminClientState(_))
        ));
    }

    #[test]
    fn test_state_and_protocol_errors_for_status() {
        let mut fx = Fixture::new();
        fx.send("status");

        // Popping before the terminating '.' is a state error.
        assert!(matches!(
            fx.handler.pop_response(),
            Err(GearmanError::InvalidAdminClientState(_))
        ));

        // A three-token status line is malformed.
        assert!(matches!(
            fx.recv_line("12\tIP-A\tCLIENT-A"),
            Err(GearmanError::Protocol(ProtocolError::TokenCount {
                received: 3,
                expected: 4,
            }))
        ));

        fx.recv_line(".").unwrap();
        assert_eq!(fx.pop(AdminCommand::Status), AdminResponse::Status(vec![]));
    }

    #[test]
    fn test_response_ready() {
        let mut fx = Fixture::new();
        fx.send("status");

        assert!(!fx.handler.response_ready());
        fx.recv_line(".").unwrap();
        assert!(fx.handler.response_ready());
    }

    #[test]
    fn test_multiple_status() {
        let mut fx = Fixture::new();
        fx.send("status");
        fx.recv_line("test_function\t1\t5\t17").unwrap();
        fx.recv_line("another_function\t2\t4\t23").unwrap();
        fx.recv_line(".").unwrap();

        let response = fx.pop(AdminCommand::Status);
        assert_eq!(
            response,
            AdminResponse::Status(vec![
                StatusEntry {
                    task: String::from("test_function"),
                    queued: 1,
                    running: 5,
                    workers: 17,
                },
                StatusEntry {
                    task: String::from("another_function"),
                    queued: 2,
                    running: 4,
                    workers: 23,
                },
            ])
        );
    }

    #[test]
    fn test_version() {
        let mut fx = Fixture::new();
        fx.send("version");
        fx.recv_line("0.12345").unwrap();

        assert_eq!(
            fx.pop(AdminCommand::Version),
            AdminResponse::Version(String::from("0.12345"))
        );
    }

    #[test]
    fn test_state_and_protocol_errors_for_workers() {
        let mut fx = Fixture::new();
        fx.send("workers");

        assert!(matches!(
            fx.handler.pop_response(),
            Err(GearmanError::InvalidAdminClientState(_))
        ));

        // Too few tokens.
        assert!(matches!(
            fx.recv_line("12 IP-A CLIENT-A"),
            Err(GearmanError::Protocol(ProtocolError::MalformedResponse(_)))
        ));

        // Wrong separator token.
        assert!(matches!(
            fx.recv_line("12 IP-A CLIENT-A NOT:"),
            Err(GearmanError::Protocol(ProtocolError::MalformedResponse(_)))
        ));

        fx.recv_line(".").unwrap();
        assert_eq!(
            fx.pop(AdminCommand::Workers),
            AdminResponse::Workers(vec![])
        );
    }

    #[test]
    fn test_multiple_workers() {
        let mut fx = Fixture::new();
        fx.send("workers");
        fx.recv_line("12 IP-A CLIENT-A : function-A function-B").unwrap();
        fx.recv_line("13 IP-B CLIENT-B : function-C").unwrap();
        fx.recv_line(".").unwrap();

        let response = fx.pop(AdminCommand::Workers);
        assert_eq!(
            response,
            AdminResponse::Workers(vec![
                WorkerEntry {
                    file_descriptor: String::from("12"),
                    ip: String::from("IP-A"),
                    client_id: String::from("CLIENT-A"),
                    tasks: vec![
                        String::from("function-A"),
                        String::from("function-B"),
                    ],
                },
                WorkerEntry {
                    file_descriptor: String::from("13"),
                    ip: String::from("IP-B"),
                    client_id: String::from("CLIENT-B"),
                    tasks: vec![String::from("function-C")],
                },
            ])
        );
    }

    #[test]
    fn test_maxqueue() {
        let mut fx = Fixture::new();
        fx.send("maxqueue test_function 4");

        assert!(matches!(
            fx.recv_line("NOT OK"),
            Err(GearmanError::Protocol(ProtocolError::MalformedResponse(_)))
        ));

        assert!(matches!(
            fx.handler.pop_response(),
            Err(GearmanError::InvalidAdminClientState(_))
        ));

        fx.recv_line("OK").unwrap();
        assert_eq!(fx.pop(AdminCommand::MaxQueue), AdminResponse::MaxQueue);
    }

    #[test]
    fn test_shutdown_synthesizes_response() {
        let mut fx = Fixture::new();
        fx.send("shutdown graceful");

        assert!(fx.handler.response_ready());
        assert_eq!(fx.pop(AdminCommand::Shutdown), AdminResponse::Empty);
    }

    #[test]
    fn test_getpid_synthesizes_response() {
        let mut fx = Fixture::new();
        fx.send("getpid");
        assert_eq!(fx.pop(AdminCommand::GetPid), AdminResponse::Empty);
    }

    #[test]
    fn test_cancel_job_synthesizes_response() {
        let mut fx = Fixture::new();
        fx.send("cancel job H:lap:1");
        assert_eq!(fx.pop(AdminCommand::CancelJob), AdminResponse::Empty);
    }

    #[test]
    fn test_show_jobs_empty() {
        let mut fx = Fixture::new();
        fx.send("show jobs");

        assert!(matches!(
            fx.handler.pop_response(),
            Err(GearmanError::InvalidAdminClientState(_))
        ));

        fx.recv_line(".").unwrap();
        assert_eq!(fx.pop(AdminCommand::ShowJobs), AdminResponse::Jobs(vec![]));
    }

    #[test]
    fn test_show_jobs_incorrect_tokens() {
        let mut fx = Fixture::new();
        fx.send("show jobs");

        let err = fx.recv_line("1\t2\t3").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Received 3 tokens, expected 4 tokens"
        );
    }

    #[test]
    fn test_show_jobs() {
        let mut fx = Fixture::new();
        fx.send("show jobs");
        fx.recv_line("foo\t1\t2\t3").unwrap();
        fx.recv_line("bar\t4\t5\t6").unwrap();

        assert!(matches!(
            fx.handler.pop_response(),
            Err(GearmanError::InvalidAdminClientState(_))
        ));

        fx.recv_line(".").unwrap();
        assert_eq!(
            fx.pop(AdminCommand::ShowJobs),
            AdminResponse::Jobs(vec![
                JobEntry {
                    handle: String::from("foo"),
                    queued: 1,
                    canceled: 2,
                    enabled: 3,
                },
                JobEntry {
                    handle: String::from("bar"),
                    queued: 4,
                    canceled: 5,
                    enabled: 6,
                },
            ])
        );
    }

    #[test]
    fn test_show_unique_jobs() {
        let mut fx = Fixture::new();
        fx.send("show unique jobs");
        fx.recv_line("de305d54-75b4-431b-adb2-eb6b9e546014").unwrap();
        fx.recv_line(".").unwrap();

        assert_eq!(
            fx.pop(AdminCommand::ShowUniqueJobs),
            AdminResponse::UniqueJobs(vec![String::from(
                "de305d54-75b4-431b-adb2-eb6b9e546014"
            )])
        );
    }

    #[test]
    fn test_line_with_nothing_outstanding() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.recv_line("stray"),
            Err(GearmanError::InvalidAdminClientState(_))
        ));
    }
}
