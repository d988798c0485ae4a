use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::time::Instant;

use super::{ascii_flag, ascii_u64, server_error, CommandHandler};
use crate::error::GearmanError;
use crate::net::connection::Connection;
use crate::types::job::{JobRequest, JobState};
use crate::wire::protocol::{Packet, PacketType};

/// Client-role state machine for one connection.
///
/// JOB_CREATED frames carry no request identifier, so the server's
/// acknowledgement order is the correlation: submissions park in a FIFO
/// until their handle arrives, then move to the handle map that routes
/// every later WORK_* frame.
#[derive(Debug, Default)]
pub struct ClientHandler {
    requests_awaiting_handles: VecDeque<JobRequest>,
    handle_to_request_map: HashMap<Bytes, JobRequest>,
}

impl ClientHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the SUBMIT_JOB variant for this request and parks it until
    /// the server acknowledges with a handle.
    pub fn send_job_request(
        &mut self,
        conn: &mut Connection,
        request: &JobRequest,
    ) {
        let kind = PacketType::submit_variant(
            request.background(),
            request.priority(),
        );
        conn.send_command(Packet::new(
            kind,
            vec![request.task(), request.unique(), request.data()],
        ));

        request.with(|r| r.state = JobState::Pending);
        self.requests_awaiting_handles.push_back(request.clone());
    }

    /// Queues a GET_STATUS probe. The handle mapping is (re-)registered so
    /// the STATUS_RES resolves even for requests that already reached a
    /// terminal state.
    pub fn send_get_status_of_job(
        &mut self,
        conn: &mut Connection,
        request: &JobRequest,
    ) {
        let handle = request.job_handle();
        self.handle_to_request_map.insert(handle.clone(), request.clone());
        conn.send_command(Packet::new(
            PacketType::GetStatus,
            vec![handle],
        ));
    }

    /// Whether a handle is currently mapped to a request.
    pub fn tracks_handle(&self, handle: &[u8]) -> bool {
        self.handle_to_request_map.contains_key(handle)
    }

    pub fn awaiting_handles(&self) -> usize {
        self.requests_awaiting_handles.len()
    }

    fn request_for(
        &self,
        handle: &Bytes,
        kind: PacketType,
    ) -> Result<JobRequest, GearmanError> {
        self.handle_to_request_map.get(handle).cloned().ok_or_else(|| {
            GearmanError::InvalidClientState(format!(
                "received {kind} for unknown handle {:?}",
                String::from_utf8_lossy(handle)
            ))
        })
    }

    fn require_state(
        request: &JobRequest,
        required: JobState,
        kind: PacketType,
    ) -> Result<(), GearmanError> {
        let state = request.state();
        if state != required {
            return Err(GearmanError::InvalidClientState(format!(
                "received {kind} for a request in state {state:?}, \
                 expected {required:?}"
            )));
        }

        Ok(())
    }

    fn recv_job_created(
        &mut self,
        handle: Bytes,
    ) -> Result<(), GearmanError> {
        let Some(request) = self.requests_awaiting_handles.pop_front() else {
            return Err(GearmanError::InvalidClientState(String::from(
                "received JOB_CREATED with no submissions awaiting handles",
            )));
        };

        Self::require_state(&request, JobState::Pending, PacketType::JobCreated)?;

        request.with(|r| {
            r.job.handle = handle.clone();
            r.state = JobState::Created;
        });
        self.handle_to_request_map.insert(handle, request);

        Ok(())
    }

    fn recv_work_data(
        &mut self,
        handle: Bytes,
        data: Bytes,
    ) -> Result<(), GearmanError> {
        let request = self.request_for(&handle, PacketType::WorkData)?;
        Self::require_state(&request, JobState::Created, PacketType::WorkData)?;

        request.with(|r| r.data_updates.push_back(data));

        Ok(())
    }

    fn recv_work_warning(
        &mut self,
        handle: Bytes,
        data: Bytes,
    ) -> Result<(), GearmanError> {
        let request = self.request_for(&handle, PacketType::WorkWarning)?;
        Self::require_state(
            &request,
            JobState::Created,
            PacketType::WorkWarning,
        )?;

        request.with(|r| r.warning_updates.push_back(data));

        Ok(())
    }

    fn recv_work_status(
        &mut self,
        handle: Bytes,
        numerator: u64,
        denominator: u64,
    ) -> Result<(), GearmanError> {
        let request = self.request_for(&handle, PacketType::WorkStatus)?;
        Self::require_state(&request, JobState::Created, PacketType::WorkStatus)?;

        request.with(|r| {
            r.status.handle = handle;
            r.status.known = true;
            r.status.running = true;
            r.status.numerator = numerator;
            r.status.denominator = denominator;
        });

        Ok(())
    }

    fn recv_work_complete(
        &mut self,
        handle: Bytes,
        data: Bytes,
    ) -> Result<(), GearmanError> {
        let request = self.request_for(&handle, PacketType::WorkComplete)?;
        Self::require_state(
            &request,
            JobState::Created,
            PacketType::WorkComplete,
        )?;

        request.with(|r| {
            r.result = Some(data);
            r.state = JobState::Complete;
        });
        self.handle_to_request_map.remove(&handle);

        Ok(())
    }

    fn recv_work_fail(&mut self, handle: Bytes) -> Result<(), GearmanError> {
        let request = self.request_for(&handle, PacketType::WorkFail)?;
        Self::require_state(&request, JobState::Created, PacketType::WorkFail)?;

        request.with(|r| r.state = JobState::Failed);
        self.handle_to_request_map.remove(&handle);

        Ok(())
    }

    fn recv_status_res(
        &mut self,
        packet: &Packet,
    ) -> Result<(), GearmanError> {
        let [handle, known, running, numerator, denominator] =
            packet.expect_args::<5>()?;
        let request = self.request_for(handle, PacketType::StatusRes)?;

        let numerator = ascii_u64(numerator, "numerator")?;
        let denominator = ascii_u64(denominator, "denominator")?;

        request.with(|r| {
            r.status.handle = handle.clone();
            r.status.known = ascii_flag(known);
            r.status.running = ascii_flag(running);
            r.status.numerator = numerator;
            r.status.denominator = denominator;
            r.status.time_received = Some(Instant::now());
        });

        Ok(())
    }
}

impl CommandHandler for ClientHandler {
    fn on_connect(
        &mut self,
        _conn: &mut Connection,
    ) -> Result<(), GearmanError> {
        Ok(())
    }

    fn on_disconnect(&mut self) {
        // Make cleanup deterministic: every in-flight request leaves the
        // correlation structures, and non-terminal ones return to Unknown
        // so the manager can resubmit while attempts remain.
        for request in self.requests_awaiting_handles.drain(..) {
            reset_if_unfinished(&request);
        }
        for (_, request) in self.handle_to_request_map.drain() {
            reset_if_unfinished(&request);
        }
    }

    fn recv_packet(
        &mut self,
        _conn: &mut Connection,
        packet: Packet,
    ) -> Result<(), GearmanError> {
        match packet.kind {
            PacketType::JobCreated => {
                let [handle] = packet.expect_args::<1>()?;
                self.recv_job_created(handle.clone())
            },
            PacketType::WorkData => {
                let [handle, data] = packet.expect_args::<2>()?;
                self.recv_work_data(handle.clone(), data.clone())
            },
            PacketType::WorkWarning => {
                let [handle, data] = packet.expect_args::<2>()?;
                self.recv_work_warning(handle.clone(), data.clone())
            },
            PacketType::WorkStatus => {
                let [handle, numerator, denominator] =
                    packet.expect_args::<3>()?;
                let numerator = ascii_u64(numerator, "numerator")?;
                let denominator = ascii_u64(denominator, "denominator")?;
                self.recv_work_status(handle.clone(), numerator, denominator)
            },
            PacketType::WorkComplete => {
                let [handle, data] = packet.expect_args::<2>()?;
                self.recv_work_complete(handle.clone(), data.clone())
            },
            PacketType::WorkFail => {
                let [handle] = packet.expect_args::<1>()?;
                self.recv_work_fail(handle.clone())
            },
            PacketType::StatusRes => self.recv_status_res(&packet),
            PacketType::Error => Err(server_error(&packet)),
            kind => Err(GearmanError::InvalidClientState(format!(
                "client received unexpected {kind}"
            ))),
        }
    }
}

fn reset_if_unfinished(request: &JobRequest) {
    request.with(|r| {
        if !matches!(r.state, JobState::Complete | JobState::Failed) {
            r.state = JobState::Unknown;
        }
        r.job.connection = None;
    });
}
