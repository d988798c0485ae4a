use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::warn;

use super::{deadline_after, remaining, Pool, ServerSpec};
use crate::error::GearmanError;
use crate::handler::client::ClientHandler;
use crate::types::job::{Job, JobRequest, JobState, JobStatus, Priority};
use crate::types::task::Taskset;

/// Connection attempts granted per request by default, as a multiple of
/// the configured server count.
pub const CONNECTION_ATTEMPTS_MULTIPLIER: u32 = 3;

/// Per-submission options for [Client::submit_job].
#[derive(Clone, Debug)]
pub struct SubmitOptions {
    /// Deduplication key within (server, task); empty when absent.
    pub unique: Option<Bytes>,
    pub priority: Priority,
    pub background: bool,
    /// Whether to run the event loop until the request reaches a terminal
    /// state, or only until the server accepts it.
    pub wait_until_complete: bool,
    /// Overall deadline for the submission, threaded into every poll.
    pub poll_timeout: Option<Duration>,
    /// Cap on connection attempts; defaults to three per configured
    /// server.
    pub max_connection_attempts: Option<u32>,
    /// Resubmissions granted after WORK_FAIL.
    pub max_retries: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            unique: None,
            priority: Priority::None,
            background: false,
            wait_until_complete: true,
            poll_timeout: None,
            max_connection_attempts: None,
            max_retries: 0,
        }
    }
}

/// One job of a [Client::submit_multiple_jobs] batch.
#[derive(Clone, Debug)]
pub struct JobSubmission {
    pub task: Bytes,
    pub data: Bytes,
    pub options: SubmitOptions,
}

impl JobSubmission {
    pub fn new(task: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            task: task.into(),
            data: data.into(),
            options: SubmitOptions::default(),
        }
    }
}

/// Submits jobs to one or more Gearman servers and tracks them to
/// completion.
///
/// All operations run on the caller's task: each blocks on the shared
/// event loop until its requests reach the desired state or the deadline
/// lapses. A connection failure only aborts an operation once the failing
/// request has used up its attempt budget; until then the request rotates
/// to the next candidate server.
pub struct Client {
    pool: Pool<ClientHandler>,
}

impl Client {
    pub fn new(
        hosts: impl IntoIterator<Item = ServerSpec>,
    ) -> Result<Self, GearmanError> {
        Ok(Self { pool: Pool::new(hosts, ClientHandler::new)? })
    }

    fn default_max_connection_attempts(&self) -> u32 {
        (self.pool.len() as u32).max(1) * CONNECTION_ATTEMPTS_MULTIPLIER
    }

    fn build_request(
        &self,
        task: Bytes,
        data: Bytes,
        options: &SubmitOptions,
    ) -> JobRequest {
        let unique = options.unique.clone().unwrap_or_default();
        let job = Job::new(Bytes::new(), task, unique, data, None);
        let request = JobRequest::new(
            job,
            options.priority,
            options.background,
            options
                .max_connection_attempts
                .unwrap_or_else(|| self.default_max_connection_attempts()),
        );
        request.with(|r| r.max_retries = options.max_retries);

        request
    }

    /// Submits one job. Returns once the server accepted it (and, unless
    /// `wait_until_complete` is off, once it finished) or the
    /// `poll_timeout` deadline lapsed, leaving `timed_out` set on the
    /// returned request.
    pub async fn submit_job(
        &mut self,
        task: impl Into<Bytes>,
        data: impl Into<Bytes>,
        options: SubmitOptions,
    ) -> Result<JobRequest, GearmanError> {
        let request =
            self.build_request(task.into(), data.into(), &options);

        self.submit_requests(
            std::slice::from_ref(&request),
            options.wait_until_complete,
            options.poll_timeout,
        )
        .await?;

        Ok(request)
    }

    /// Vectorized submission: every job is sent before the first wait.
    pub async fn submit_multiple_jobs(
        &mut self,
        submissions: Vec<JobSubmission>,
        wait_until_complete: bool,
        poll_timeout: Option<Duration>,
    ) -> Result<Vec<JobRequest>, GearmanError> {
        let requests: Vec<JobRequest> = submissions
            .into_iter()
            .map(|s| self.build_request(s.task, s.data, &s.options))
            .collect();

        self.submit_requests(&requests, wait_until_complete, poll_timeout)
            .await?;

        Ok(requests)
    }

    async fn submit_requests(
        &mut self,
        requests: &[JobRequest],
        wait_until_complete: bool,
        poll_timeout: Option<Duration>,
    ) -> Result<(), GearmanError> {
        // One deadline spans both phases.
        let deadline = deadline_after(poll_timeout);

        self.wait_until_jobs_accepted(
            requests,
            remaining(deadline).as_poll_timeout(),
        )
        .await?;

        if wait_until_complete {
            self.wait_until_jobs_completed(
                requests,
                remaining(deadline).as_poll_timeout(),
            )
            .await?;
        }

        Ok(())
    }

    /// Runs the event loop until every request has left PENDING. Requests
    /// knocked back to UNKNOWN by a connection loss are resubmitted while
    /// their attempt budget lasts; exhausting it raises
    /// [GearmanError::ExceededConnectionAttempts].
    pub async fn wait_until_jobs_accepted(
        &mut self,
        requests: &[JobRequest],
        poll_timeout: Option<Duration>,
    ) -> Result<(), GearmanError> {
        let deadline = deadline_after(poll_timeout);

        loop {
            for request in requests {
                if request.state() == JobState::Unknown {
                    self.send_job_request(request).await?;
                }
            }

            if requests.iter().all(|r| r.state() != JobState::Pending) {
                return Ok(());
            }

            let rem = remaining(deadline);
            if rem.is_expired() {
                mark_unfinished_timed_out(requests, |r| {
                    r.state() == JobState::Pending
                });
                return Ok(());
            }

            self.pool.poll_once(rem.as_poll_timeout()).await?;
        }
    }

    /// Runs the event loop until every request reaches a terminal state
    /// (acceptance, for background requests) or the deadline lapses.
    /// Failed requests with retries remaining are resubmitted.
    pub async fn wait_until_jobs_completed(
        &mut self,
        requests: &[JobRequest],
        poll_timeout: Option<Duration>,
    ) -> Result<(), GearmanError> {
        let deadline = deadline_after(poll_timeout);

        loop {
            for request in requests {
                match request.state() {
                    JobState::Unknown => {
                        self.send_job_request(request).await?;
                    },
                    JobState::Failed => {
                        let retry = request.with(|r| {
                            if r.retries < r.max_retries {
                                r.retries += 1;
                                true
                            } else {
                                false
                            }
                        });
                        if retry {
                            request.reset();
                            self.send_job_request(request).await?;
                        }
                    },
                    _ => {},
                }
            }

            if requests.iter().all(JobRequest::complete) {
                return Ok(());
            }

            let rem = remaining(deadline);
            if rem.is_expired() {
                mark_unfinished_timed_out(requests, |r| !r.complete());
                return Ok(());
            }

            self.pool.poll_once(rem.as_poll_timeout()).await?;
        }
    }

    /// Probes the server for a job's status, polling until STATUS_RES
    /// arrives or the deadline lapses (which sets `timed_out`).
    pub async fn get_job_status(
        &mut self,
        request: &JobRequest,
        poll_timeout: Option<Duration>,
    ) -> Result<JobStatus, GearmanError> {
        request.with(|r| r.status.time_received = None);

        let idx = match request.with(|r| r.job.connection) {
            Some(idx)
                if self.pool.endpoints[idx].connection.connected() =>
            {
                idx
            },
            _ => self.establish_request_connection(request).await?,
        };
        {
            let ep = &mut self.pool.endpoints[idx];
            ep.handler.send_get_status_of_job(&mut ep.connection, request);
        }

        let deadline = deadline_after(poll_timeout);
        loop {
            if request.status().time_received.is_some() {
                return Ok(request.status());
            }

            let rem = remaining(deadline);
            if rem.is_expired() {
                request.with(|r| r.timed_out = true);
                return Ok(request.status());
            }

            self.pool.poll_once(rem.as_poll_timeout()).await?;
        }
    }

    /// Submits every unfinished task of the set and drives its hooks:
    /// on_status for progress, on_retry for resubmissions, on_complete /
    /// on_fail / on_post at termination. Returns early when the set is
    /// cancelled or the deadline lapses.
    pub async fn submit_taskset(
        &mut self,
        taskset: &mut Taskset,
        poll_timeout: Option<Duration>,
    ) -> Result<(), GearmanError> {
        let mut pairs = Vec::new();
        for task in taskset.tasks() {
            if task.is_finished {
                continue;
            }
            let options = SubmitOptions {
                unique: Some(task.effective_unique()),
                priority: if task.high_priority {
                    Priority::High
                } else {
                    Priority::None
                },
                background: task.background,
                ..SubmitOptions::default()
            };
            let request = self.build_request(
                task.func.clone(),
                task.arg.clone(),
                &options,
            );
            pairs.push((task.fingerprint(), request, (0u64, 0u64)));
        }

        let deadline = deadline_after(poll_timeout);
        loop {
            if taskset.is_cancelled() {
                return Ok(());
            }

            let mut all_done = true;
            for (fingerprint, request, last_status) in &mut pairs {
                let Some(task) = taskset.task_mut(*fingerprint) else {
                    continue;
                };
                if task.is_finished {
                    continue;
                }

                match request.state() {
                    JobState::Unknown => {
                        self.send_job_request(request).await?;
                        all_done = false;
                    },
                    JobState::Pending => all_done = false,
                    JobState::Created => {
                        if task.handle.is_none() {
                            task.handle = Some(request.job_handle());
                        }
                        if request.background() {
                            // Accepted is as far as a background task
                            // can be observed.
                            task.complete(Bytes::new());
                        } else {
                            let status = request.status();
                            let progress =
                                (status.numerator, status.denominator);
                            if progress != *last_status {
                                *last_status = progress;
                                task.status(progress.0, progress.1);
                            }
                            all_done = false;
                        }
                    },
                    JobState::Complete => {
                        task.handle = Some(request.job_handle());
                        task.complete(request.result().unwrap_or_default());
                    },
                    JobState::Failed => {
                        if task.retries_done < task.retry_count {
                            task.retrying();
                            request.reset();
                            self.send_job_request(request).await?;
                            all_done = false;
                        } else {
                            task.fail();
                        }
                    },
                }
            }

            if all_done {
                return Ok(());
            }

            let rem = remaining(deadline);
            if rem.is_expired() {
                let requests: Vec<JobRequest> =
                    pairs.iter().map(|(_, r, _)| r.clone()).collect();
                mark_unfinished_timed_out(&requests, |r| !r.complete());
                return Ok(());
            }

            self.pool.poll_once(rem.as_poll_timeout()).await?;
        }
    }

    /// Sends one submission, charging the request's attempt budget.
    async fn send_job_request(
        &mut self,
        request: &JobRequest,
    ) -> Result<(), GearmanError> {
        let (attempts, max_attempts) = request
            .with(|r| (r.connection_attempts, r.max_connection_attempts));
        if attempts >= max_attempts {
            return Err(GearmanError::ExceededConnectionAttempts { attempts });
        }

        let idx = self.establish_request_connection(request).await?;
        request.with(|r| {
            r.connection_attempts += 1;
            r.job.connection = Some(idx);
        });

        let ep = &mut self.pool.endpoints[idx];
        ep.handler.send_job_request(&mut ep.connection, request);

        Ok(())
    }

    /// Picks a live connection for this request from its rotating
    /// candidate queue, connecting as needed. The queue starts as a
    /// shuffled copy of the server list, resumes where it left off on
    /// repeat calls, and rotates failed candidates to the back.
    async fn establish_request_connection(
        &mut self,
        request: &JobRequest,
    ) -> Result<usize, GearmanError> {
        let total = self.pool.len();
        if total == 0 {
            return Err(GearmanError::ServerUnavailable(String::from(
                "no servers configured",
            )));
        }

        request.with(|r| {
            if r.rotation.is_none() {
                let mut order: Vec<usize> = (0..total).collect();
                order.shuffle(&mut rand::thread_rng());
                r.rotation = Some(order.into());
            }
        });

        let mut failures = 0;
        let mut chosen = None;
        for offset in 0..total {
            let idx =
                request.with(|r| r.rotation.as_ref().unwrap()[offset]);
            match self.pool.establish(idx).await {
                Ok(()) => {
                    chosen = Some(idx);
                    break;
                },
                Err(error) => {
                    warn!(%error, "failed to reach candidate server");
                    failures += 1;
                },
            }
        }

        let Some(idx) = chosen else {
            return Err(GearmanError::ServerUnavailable(format!(
                "exhausted all {total} candidate servers"
            )));
        };

        request
            .with(|r| r.rotation.as_mut().unwrap().rotate_left(failures));

        Ok(idx)
    }
}

fn mark_unfinished_timed_out(
    requests: &[JobRequest],
    unfinished: impl Fn(&JobRequest) -> bool,
) {
    for request in requests {
        if unfinished(request) {
            request.with(|r| r.timed_out = true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::types::task::Task;
    use crate::wire::protocol::{Packet, PacketType};
    use crate::wire::Codec;

    type ServerSide = Framed<TcpStream, Codec>;

    async fn accept(listener: &TcpListener) -> ServerSide {
        let (sock, _) = listener.accept().await.unwrap();
        Framed::new(sock, Codec::server_side())
    }

    async fn next_packet(framed: &mut ServerSide) -> Packet {
        framed.next().await.unwrap().unwrap()
    }

    /// Reads frames until the client hangs up, so buffered writes are
    /// never lost to an early server exit.
    async fn drain(mut framed: ServerSide) {
        while let Some(frame) = framed.next().await {
            if frame.is_err() {
                break;
            }
        }
    }

    async fn local_client() -> (Client, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::new([ServerSpec::new(addr.ip().to_string())
            .port(addr.port())])
        .unwrap();

        (client, listener)
    }

    fn handle(packet: &Packet) -> Bytes {
        packet.args[0].clone()
    }

    #[tokio::test]
    async fn test_single_fg_job_submission() {
        let (mut client, listener) = local_client().await;

        let server: JoinHandle<()> = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            let submit = next_packet(&mut framed).await;
            assert_eq!(submit.kind, PacketType::SubmitJob);
            assert_eq!(submit.args[0], Bytes::from_static(b"reverse"));
            assert_eq!(submit.args[2], Bytes::from_static(b"result"));

            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![Bytes::from_static(b"H:lap:1")],
                ))
                .await
                .unwrap();
            framed
                .send(Packet::new(
                    PacketType::WorkComplete,
                    vec![
                        Bytes::from_static(b"H:lap:1"),
                        Bytes::from_static(b"tluser"),
                    ],
                ))
                .await
                .unwrap();

            drain(framed).await;
        });

        let request = client
            .submit_job("reverse", "result", SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(request.state(), JobState::Complete);
        assert_eq!(request.result(), Some(Bytes::from_static(b"tluser")));
        assert!(request.complete());
        assert!(!request.timed_out());
        assert_eq!(request.job_handle(), Bytes::from_static(b"H:lap:1"));

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_bg_job_submission() {
        let (mut client, listener) = local_client().await;

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            let submit = next_packet(&mut framed).await;
            assert_eq!(submit.kind, PacketType::SubmitJobLowBg);

            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![Bytes::from_static(b"H:lap:2")],
                ))
                .await
                .unwrap();

            drain(framed).await;
        });

        let request = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    background: true,
                    priority: Priority::Low,
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(request.background());
        assert_eq!(request.priority(), Priority::Low);
        assert_eq!(request.state(), JobState::Created);
        assert!(request.complete());
        assert_eq!(request.result(), None);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fg_job_submission_timeout() {
        let (mut client, listener) = local_client().await;

        // A server that accepts the job but never acknowledges it.
        let server = tokio::spawn(async move {
            let framed = accept(&listener).await;
            drain(framed).await;
        });

        let request = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    priority: Priority::High,
                    poll_timeout: Some(Duration::from_millis(10)),
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(request.priority(), Priority::High);
        assert!(!request.background());
        assert_eq!(request.state(), JobState::Pending);
        assert!(!request.complete());
        assert!(request.timed_out());

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_retry_until_accepted() {
        let (mut client, listener) = local_client().await;
        let failures = 3u32;

        let server = tokio::spawn(async move {
            // Kill the first connections as soon as they arrive.
            for _ in 0..failures {
                let (sock, _) = listener.accept().await.unwrap();
                drop(sock);
            }

            let mut framed = accept(&listener).await;
            let submit = next_packet(&mut framed).await;
            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![handle(&submit)],
                ))
                .await
                .unwrap();
            drain(framed).await;
        });

        let request = client
            .submit_job(
                "reverse",
                "uniq-as-handle",
                SubmitOptions {
                    wait_until_complete: false,
                    max_connection_attempts: Some(failures + 1),
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(request.state(), JobState::Created);
        assert_eq!(request.connection_attempts(), failures + 1);
        assert_eq!(
            request.connection_attempts(),
            request.max_connection_attempts()
        );

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_retry_exhaustion() {
        let (mut client, listener) = local_client().await;
        let failures = 3u32;

        let server = tokio::spawn(async move {
            for _ in 0..failures {
                let (sock, _) = listener.accept().await.unwrap();
                drop(sock);
            }
        });

        let error = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    wait_until_complete: false,
                    max_connection_attempts: Some(failures),
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            GearmanError::ExceededConnectionAttempts { attempts } if attempts == failures
        ));

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_servers_is_unavailable() {
        let mut client = Client::new([]).unwrap();

        let error = client
            .submit_job("reverse", "payload", SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, GearmanError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dead_server_is_unavailable() {
        // Reserve a port, then refuse everything on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = Client::new([ServerSpec::new(
            addr.ip().to_string(),
        )
        .port(addr.port())])
        .unwrap();

        let error = client
            .submit_job("reverse", "payload", SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, GearmanError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_rotation_skips_dead_server() {
        // One dead endpoint, one live one; the request must land on the
        // live server no matter how the rotation shuffled.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;
            let submit = next_packet(&mut framed).await;
            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![handle(&submit)],
                ))
                .await
                .unwrap();
            drain(framed).await;
        });

        let mut client = Client::new([
            ServerSpec::new(dead_addr.ip().to_string()).port(dead_addr.port()),
            ServerSpec::new(live_addr.ip().to_string()).port(live_addr.port()),
        ])
        .unwrap();

        let request = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    wait_until_complete: false,
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(request.state(), JobState::Created);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_jobs_complete_fail_and_timeout() {
        let (mut client, listener) = local_client().await;

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            for n in 1..=3u8 {
                let submit = next_packet(&mut framed).await;
                assert_eq!(submit.kind, PacketType::SubmitJob);
                framed
                    .send(Packet::new(
                        PacketType::JobCreated,
                        vec![Bytes::from(format!("H:lap:{n}"))],
                    ))
                    .await
                    .unwrap();
            }

            framed
                .send(Packet::new(
                    PacketType::WorkComplete,
                    vec![
                        Bytes::from_static(b"H:lap:1"),
                        Bytes::from_static(b"12345"),
                    ],
                ))
                .await
                .unwrap();
            framed
                .send(Packet::new(
                    PacketType::WorkFail,
                    vec![Bytes::from_static(b"H:lap:2")],
                ))
                .await
                .unwrap();

            drain(framed).await;
        });

        let submissions = vec![
            JobSubmission::new("job", "one"),
            JobSubmission::new("job", "two"),
            JobSubmission::new("job", "three"),
        ];
        let requests = client
            .submit_multiple_jobs(submissions, false, None)
            .await
            .unwrap();
        client
            .wait_until_jobs_completed(
                &requests,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert_eq!(requests[0].state(), JobState::Complete);
        assert_eq!(requests[0].result(), Some(Bytes::from_static(b"12345")));
        assert!(!requests[0].timed_out());

        assert_eq!(requests[1].state(), JobState::Failed);
        assert_eq!(requests[1].result(), None);
        assert!(!requests[1].timed_out());

        assert_eq!(requests[2].state(), JobState::Created);
        assert_eq!(requests[2].result(), None);
        assert!(requests[2].timed_out());

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_job_status() {
        let (mut client, listener) = local_client().await;

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            let submit = next_packet(&mut framed).await;
            let job_handle = handle(&submit);
            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![job_handle.clone()],
                ))
                .await
                .unwrap();

            let status = next_packet(&mut framed).await;
            assert_eq!(status.kind, PacketType::GetStatus);
            assert_eq!(status.args[0], job_handle);

            framed
                .send(Packet::new(
                    PacketType::StatusRes,
                    vec![
                        job_handle,
                        Bytes::from_static(b"1"),
                        Bytes::from_static(b"0"),
                        Bytes::from_static(b"0"),
                        Bytes::from_static(b"1"),
                    ],
                ))
                .await
                .unwrap();

            drain(framed).await;
        });

        let request = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    wait_until_complete: false,
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        let status = client.get_job_status(&request, None).await.unwrap();
        assert!(status.known);
        assert!(!status.running);
        assert_eq!(status.numerator, 0);
        assert_eq!(status.denominator, 1);
        assert!(status.time_received.is_some());
        assert!(!request.timed_out());

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_job_status_timeout() {
        let (mut client, listener) = local_client().await;

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            let submit = next_packet(&mut framed).await;
            framed
                .send(Packet::new(
                    PacketType::JobCreated,
                    vec![handle(&submit)],
                ))
                .await
                .unwrap();

            // Swallow the GET_STATUS and never answer.
            drain(framed).await;
        });

        let request = client
            .submit_job(
                "reverse",
                "payload",
                SubmitOptions {
                    wait_until_complete: false,
                    ..SubmitOptions::default()
                },
            )
            .await
            .unwrap();

        let status = client
            .get_job_status(&request, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(status.time_received, None);
        assert!(request.timed_out());

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_taskset_drives_hooks() {
        let (mut client, listener) = local_client().await;

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            // The taskset iterates in hash order, so correlate handles by
            // each submission's argument.
            let mut alpha_handle = None;
            let mut beta_handle = None;
            for n in 1..=2u8 {
                let submit = next_packet(&mut framed).await;
                assert_eq!(submit.kind, PacketType::SubmitJob);

                let job_handle = Bytes::from(format!("H:lap:{n}"));
                if submit.args[2] == Bytes::from_static(b"alpha") {
                    alpha_handle = Some(job_handle.clone());
                } else {
                    beta_handle = Some(job_handle.clone());
                }

                framed
                    .send(Packet::new(
                        PacketType::JobCreated,
                        vec![job_handle],
                    ))
                    .await
                    .unwrap();
            }

            framed
                .send(Packet::new(
                    PacketType::WorkComplete,
                    vec![alpha_handle.unwrap(), Bytes::from_static(b"first")],
                ))
                .await
                .unwrap();
            framed
                .send(Packet::new(
                    PacketType::WorkFail,
                    vec![beta_handle.unwrap()],
                ))
                .await
                .unwrap();

            drain(framed).await;
        });

        let results = Rc::new(RefCell::new(Vec::new()));
        let failures = Rc::new(RefCell::new(0u32));
        let posts = Rc::new(RefCell::new(0u32));

        let mut taskset = Taskset::default();
        taskset.add({
            let results = results.clone();
            let posts = posts.clone();
            Task::new("work", "alpha")
                .unique("alpha")
                .on_complete(move |out| {
                    results.borrow_mut().push(out.to_vec())
                })
                .on_post(move || *posts.borrow_mut() += 1)
        });
        taskset.add({
            let failures = failures.clone();
            let posts = posts.clone();
            Task::new("work", "beta")
                .unique("beta")
                .on_fail(move || *failures.borrow_mut() += 1)
                .on_post(move || *posts.borrow_mut() += 1)
        });

        client.submit_taskset(&mut taskset, None).await.unwrap();

        assert_eq!(*results.borrow(), vec![b"first".to_vec()]);
        assert_eq!(*failures.borrow(), 1);
        assert_eq!(*posts.borrow(), 2);
        assert!(taskset.tasks().all(|t| t.is_finished));

        drop(client);
        server.await.unwrap();
    }
}
