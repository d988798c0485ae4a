use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::{deadline_after, remaining, Pool, ServerSpec};
use crate::error::GearmanError;
use crate::handler::admin::{
    AdminCommand, AdminHandler, AdminResponse, JobEntry, StatusEntry,
    WorkerEntry, ECHO_STRING,
};

/// Introspects and controls a single Gearman server over the textual
/// admin protocol (plus binary ECHO for liveness).
///
/// The admin channel talks to exactly one server; every operation sends
/// its command and runs the event loop until the reply is complete or
/// the configured poll timeout lapses.
pub struct AdminClient {
    pool: Pool<AdminHandler>,
    poll_timeout: Option<Duration>,
}

impl AdminClient {
    pub fn new(host: ServerSpec) -> Result<Self, GearmanError> {
        Ok(Self {
            pool: Pool::new([host], AdminHandler::new)?,
            poll_timeout: None,
        })
    }

    /// Bounds how long each operation waits for the server's reply.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = Some(poll_timeout);
        self
    }

    /// Round-trips ECHO_STRING through the server, returning the elapsed
    /// time.
    pub async fn ping_server(&mut self) -> Result<Duration, GearmanError> {
        let started = Instant::now();

        self.pool.establish(0).await?;
        {
            let ep = &mut self.pool.endpoints[0];
            ep.handler
                .send_echo_request(&mut ep.connection, Bytes::from_static(ECHO_STRING));
        }
        let response = self.wait_for_response(AdminCommand::Echo).await?;

        match response {
            AdminResponse::Echo(data) if data == ECHO_STRING => {
                Ok(started.elapsed())
            },
            AdminResponse::Echo(_) => {
                Err(GearmanError::InvalidAdminClientState(String::from(
                    "echo reply did not match the request payload",
                )))
            },
            other => Err(mismatched(AdminCommand::Echo, &other)),
        }
    }

    /// Per-function queue and worker counts.
    pub async fn get_status(
        &mut self,
    ) -> Result<Vec<StatusEntry>, GearmanError> {
        match self.round_trip("status").await? {
            AdminResponse::Status(entries) => Ok(entries),
            other => Err(mismatched(AdminCommand::Status, &other)),
        }
    }

    /// Every connected worker with its registered functions.
    pub async fn get_workers(
        &mut self,
    ) -> Result<Vec<WorkerEntry>, GearmanError> {
        match self.round_trip("workers").await? {
            AdminResponse::Workers(entries) => Ok(entries),
            other => Err(mismatched(AdminCommand::Workers, &other)),
        }
    }

    /// The server's version string.
    pub async fn get_version(&mut self) -> Result<String, GearmanError> {
        match self.round_trip("version").await? {
            AdminResponse::Version(version) => Ok(version),
            other => Err(mismatched(AdminCommand::Version, &other)),
        }
    }

    /// Caps a function's queue length on the server.
    pub async fn send_maxqueue(
        &mut self,
        task: &str,
        max_size: u32,
    ) -> Result<(), GearmanError> {
        match self.round_trip(&format!("maxqueue {task} {max_size}")).await? {
            AdminResponse::MaxQueue => Ok(()),
            other => Err(mismatched(AdminCommand::MaxQueue, &other)),
        }
    }

    /// Asks the server to shut down. No reply line is expected.
    pub async fn send_shutdown(
        &mut self,
        graceful: bool,
    ) -> Result<(), GearmanError> {
        let command = if graceful { "shutdown graceful" } else { "shutdown" };
        match self.round_trip(command).await? {
            AdminResponse::Empty => Ok(()),
            other => Err(mismatched(AdminCommand::Shutdown, &other)),
        }
    }

    /// Asks for the server's pid. Matching the original client, no reply
    /// line is read.
    pub async fn get_pid(&mut self) -> Result<(), GearmanError> {
        match self.round_trip("getpid").await? {
            AdminResponse::Empty => Ok(()),
            other => Err(mismatched(AdminCommand::GetPid, &other)),
        }
    }

    /// Cancels a queued job by handle. No reply line is expected.
    pub async fn cancel_job(
        &mut self,
        job_handle: &str,
    ) -> Result<(), GearmanError> {
        match self.round_trip(&format!("cancel job {job_handle}")).await? {
            AdminResponse::Empty => Ok(()),
            other => Err(mismatched(AdminCommand::CancelJob, &other)),
        }
    }

    /// Every job the server currently holds.
    pub async fn get_jobs(&mut self) -> Result<Vec<JobEntry>, GearmanError> {
        match self.round_trip("show jobs").await? {
            AdminResponse::Jobs(entries) => Ok(entries),
            other => Err(mismatched(AdminCommand::ShowJobs, &other)),
        }
    }

    /// The unique keys of every held job.
    pub async fn get_unique_jobs(
        &mut self,
    ) -> Result<Vec<String>, GearmanError> {
        match self.round_trip("show unique jobs").await? {
            AdminResponse::UniqueJobs(entries) => Ok(entries),
            other => Err(mismatched(AdminCommand::ShowUniqueJobs, &other)),
        }
    }

    async fn round_trip(
        &mut self,
        command_line: &str,
    ) -> Result<AdminResponse, GearmanError> {
        self.pool.establish(0).await?;

        let command = {
            let ep = &mut self.pool.endpoints[0];
            ep.handler.send_text_command(&mut ep.connection, command_line)?
        };

        self.wait_for_response(command).await
    }

    /// Polls until the oldest outstanding reply is complete and every
    /// queued byte (the command itself included) has reached the server.
    async fn wait_for_response(
        &mut self,
        command: AdminCommand,
    ) -> Result<AdminResponse, GearmanError> {
        let deadline = deadline_after(self.poll_timeout);

        loop {
            let ep = &self.pool.endpoints[0];
            if ep.handler.response_ready()
                && !ep.connection.has_pending_output()
            {
                break;
            }

            let rem = remaining(deadline);
            if rem.is_expired() {
                return Err(GearmanError::InvalidAdminClientState(format!(
                    "server did not answer {command} before the deadline"
                )));
            }

            self.pool.poll_once(rem.as_poll_timeout()).await?;
        }

        let (answered, response) =
            self.pool.endpoints[0].handler.pop_response()?;
        if answered != command {
            return Err(GearmanError::InvalidAdminClientState(format!(
                "popped a response for {answered} while waiting on {command}"
            )));
        }

        Ok(response)
    }
}

fn mismatched(command: AdminCommand, response: &AdminResponse) -> GearmanError {
    GearmanError::InvalidAdminClientState(format!(
        "response {response:?} does not answer {command}"
    ))
}
