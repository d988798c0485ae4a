use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{Pool, ServerSpec};
use crate::error::GearmanError;
use crate::handler::worker::WorkerHandler;
use crate::net::connection::Connection;
use crate::types::job::Job;
use crate::wire::protocol::{Packet, PacketType};

/// What a task callback may return: a result payload, or an error that
/// becomes WORK_FAIL (and WORK_EXCEPTION when forwarding is enabled).
pub type TaskResult = Result<Bytes, Box<dyn Error + Send + Sync>>;

/// A registered ability implementation.
pub type TaskCallback = Box<dyn FnMut(&mut ActiveJob<'_>) -> TaskResult>;

/// The job a callback is currently executing, with channels for streaming
/// progress back to the submitting client.
pub struct ActiveJob<'a> {
    job: &'a Job,
    conn: &'a mut Connection,
}

impl ActiveJob<'_> {
    pub fn handle(&self) -> &Bytes {
        &self.job.handle
    }

    pub fn task(&self) -> &Bytes {
        &self.job.task
    }

    pub fn unique(&self) -> &Bytes {
        &self.job.unique
    }

    pub fn data(&self) -> &Bytes {
        &self.job.data
    }

    /// Streams an intermediate WORK_DATA chunk to the client.
    pub fn send_data(&mut self, data: impl Into<Bytes>) {
        self.conn.send_command(Packet::new(
            PacketType::WorkData,
            vec![self.job.handle.clone(), data.into()],
        ));
    }

    /// Streams a WORK_WARNING chunk to the client.
    pub fn send_warning(&mut self, data: impl Into<Bytes>) {
        self.conn.send_command(Packet::new(
            PacketType::WorkWarning,
            vec![self.job.handle.clone(), data.into()],
        ));
    }

    /// Reports numeric progress via WORK_STATUS.
    pub fn send_status(&mut self, numerator: u64, denominator: u64) {
        self.conn.send_command(Packet::new(
            PacketType::WorkStatus,
            vec![
                self.job.handle.clone(),
                Bytes::from(numerator.to_string()),
                Bytes::from(denominator.to_string()),
            ],
        ));
    }
}

/// Executes jobs for one or more Gearman servers.
///
/// Callbacks run inline on the event-loop task, between frames, never
/// from the dispatch path. When several servers hand over jobs in the
/// same poll step they are executed in round-robin order, starting after
/// the connection served last.
pub struct Worker {
    pool: Pool<WorkerHandler>,
    callbacks: HashMap<Bytes, TaskCallback>,
    forward_exceptions: bool,
    rotation: usize,
}

impl Worker {
    pub fn new(
        hosts: impl IntoIterator<Item = ServerSpec>,
    ) -> Result<Self, GearmanError> {
        Ok(Self {
            pool: Pool::new(hosts, WorkerHandler::new)?,
            callbacks: HashMap::new(),
            forward_exceptions: false,
            rotation: 0,
        })
    }

    /// Forward callback errors as WORK_EXCEPTION ahead of the WORK_FAIL.
    pub fn set_forward_exceptions(&mut self, forward: bool) {
        self.forward_exceptions = forward;
    }

    /// Registers an ability, advertising it to every live server.
    pub fn register_task(
        &mut self,
        name: impl Into<Bytes>,
        callback: impl FnMut(&mut ActiveJob<'_>) -> TaskResult + 'static,
    ) {
        self.register(name.into(), None, Box::new(callback));
    }

    /// Registers an ability with a server-enforced execution timeout.
    pub fn register_task_with_timeout(
        &mut self,
        name: impl Into<Bytes>,
        timeout: Duration,
        callback: impl FnMut(&mut ActiveJob<'_>) -> TaskResult + 'static,
    ) {
        self.register(
            name.into(),
            Some(timeout.as_secs().max(1)),
            Box::new(callback),
        );
    }

    fn register(
        &mut self,
        name: Bytes,
        timeout: Option<u64>,
        callback: TaskCallback,
    ) {
        self.callbacks.insert(name.clone(), callback);
        for ep in &mut self.pool.endpoints {
            ep.handler.add_ability(
                &mut ep.connection,
                name.clone(),
                timeout,
            );
        }
    }

    /// Withdraws an ability from every server.
    pub fn unregister_task(&mut self, name: &[u8]) {
        self.callbacks.remove(name);
        for ep in &mut self.pool.endpoints {
            ep.handler.remove_ability(&mut ep.connection, name);
        }
    }

    /// Advertises a worker identity, visible in the admin `workers`
    /// listing.
    pub fn set_client_id(&mut self, client_id: impl Into<Bytes>) {
        let client_id = client_id.into();
        for ep in &mut self.pool.endpoints {
            ep.handler.set_client_id(&mut ep.connection, client_id.clone());
        }
    }

    /// Runs the grab/sleep/execute loop until no server remains
    /// reachable. `poll_timeout` bounds each poll step, not the loop.
    pub async fn work(
        &mut self,
        poll_timeout: Option<Duration>,
    ) -> Result<(), GearmanError> {
        loop {
            self.work_once(poll_timeout).await?;
        }
    }

    /// One iteration of the work loop: reconnect where needed, poll once,
    /// then execute any assigned jobs. Returns whether anything happened.
    pub async fn work_once(
        &mut self,
        poll_timeout: Option<Duration>,
    ) -> Result<bool, GearmanError> {
        for idx in 0..self.pool.len() {
            if self.pool.endpoints[idx].connection.connected() {
                continue;
            }
            if let Err(error) = self.pool.establish(idx).await {
                debug!(%error, "worker could not reach server");
            }
        }
        if self.pool.connected_count() == 0 {
            return Err(GearmanError::ServerUnavailable(String::from(
                "no server reachable for work",
            )));
        }

        let activity = self.pool.poll_once(poll_timeout).await?;
        let ran_jobs = self.run_assigned_jobs()?;

        Ok(activity || ran_jobs)
    }

    fn run_assigned_jobs(&mut self) -> Result<bool, GearmanError> {
        let total = self.pool.len();
        let mut ran = false;

        for offset in 0..total {
            let idx = (self.rotation + offset) % total;
            let ep = &mut self.pool.endpoints[idx];
            let Some(mut job) = ep.handler.take_assigned_job() else {
                continue;
            };
            job.connection = Some(idx);

            self.rotation = idx + 1;
            ran = true;

            let outcome = match self.callbacks.get_mut(&job.task) {
                Some(callback) => {
                    let mut active =
                        ActiveJob { job: &job, conn: &mut ep.connection };
                    callback(&mut active)
                },
                // The server handed over a task this worker no longer
                // implements; fail it rather than stall the queue.
                None => Err(format!(
                    "no callback registered for task {:?}",
                    String::from_utf8_lossy(&job.task)
                )
                .into()),
            };

            match outcome {
                Ok(result) => {
                    ep.connection.send_command(Packet::new(
                        PacketType::WorkComplete,
                        vec![job.handle.clone(), result],
                    ));
                },
                Err(error) => {
                    warn!(%error, task = ?job.task, "task callback failed");
                    if self.forward_exceptions {
                        ep.connection.send_command(Packet::new(
                            PacketType::WorkException,
                            vec![
                                job.handle.clone(),
                                Bytes::from(error.to_string()),
                            ],
                        ));
                    }
                    ep.connection.send_command(Packet::new(
                        PacketType::WorkFail,
                        vec![job.handle.clone()],
                    ));
                },
            }

            // Ask for the next job on this connection.
            ep.handler.grab_next(&mut ep.connection);
        }

        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::wire::Codec;

    type ServerSide = Framed<TcpStream, Codec>;

    async fn accept(listener: &TcpListener) -> ServerSide {
        let (sock, _) = listener.accept().await.unwrap();
        Framed::new(sock, Codec::server_side())
    }

    async fn next_packet(framed: &mut ServerSide) -> Packet {
        framed.next().await.unwrap().unwrap()
    }

    async fn expect_kind(framed: &mut ServerSide, kind: PacketType) -> Packet {
        let packet = next_packet(framed).await;
        assert_eq!(packet.kind, kind);
        packet
    }

    async fn local_worker() -> (Worker, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let worker = Worker::new([ServerSpec::new(addr.ip().to_string())
            .port(addr.port())])
        .unwrap();

        (worker, listener)
    }

    async fn drive(worker: &mut Worker, server: JoinHandle<()>) {
        // Step the work loop until the scripted server has seen
        // everything it expects.
        for _ in 0..200 {
            match worker.work_once(Some(Duration::from_millis(10))).await {
                Ok(_) => {},
                // The script hanging up between steps is fine; the
                // is_finished check below decides whether it got there.
                Err(GearmanError::ServerUnavailable(_)) => {},
                Err(error) => panic!("unexpected worker error: {error}"),
            }
            if server.is_finished() {
                server.await.unwrap();
                return;
            }
        }
        panic!("server script did not finish");
    }

    #[tokio::test]
    async fn test_work_cycle() {
        let (mut worker, listener) = local_worker().await;
        worker.set_client_id("test-worker");
        worker.register_task("reverse", |job| {
            let mut out = job.data().to_vec();
            out.reverse();
            job.send_status(1, 1);
            Ok(Bytes::from(out))
        });

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            expect_kind(&mut framed, PacketType::SetClientId).await;
            expect_kind(&mut framed, PacketType::ResetAbilities).await;
            let can_do = expect_kind(&mut framed, PacketType::CanDo).await;
            assert_eq!(can_do.args[0], Bytes::from_static(b"reverse"));
            expect_kind(&mut framed, PacketType::PreSleep).await;

            framed.send(Packet::empty(PacketType::Noop)).await.unwrap();
            expect_kind(&mut framed, PacketType::GrabJobUniq).await;

            framed
                .send(Packet::new(
                    PacketType::JobAssignUniq,
                    vec![
                        Bytes::from_static(b"H:lap:1"),
                        Bytes::from_static(b"reverse"),
                        Bytes::from_static(b"uniq"),
                        Bytes::from_static(b"abcd"),
                    ],
                ))
                .await
                .unwrap();

            let status = expect_kind(&mut framed, PacketType::WorkStatus).await;
            assert_eq!(status.args[1], Bytes::from_static(b"1"));

            let complete =
                expect_kind(&mut framed, PacketType::WorkComplete).await;
            assert_eq!(complete.args[0], Bytes::from_static(b"H:lap:1"));
            assert_eq!(complete.args[1], Bytes::from_static(b"dcba"));

            // After finishing, the worker asks for more work, and sleeps
            // once told there is none.
            expect_kind(&mut framed, PacketType::GrabJobUniq).await;
            framed.send(Packet::empty(PacketType::NoJob)).await.unwrap();
            expect_kind(&mut framed, PacketType::PreSleep).await;
        });

        drive(&mut worker, server).await;
    }

    #[tokio::test]
    async fn test_failing_callback_sends_work_fail() {
        let (mut worker, listener) = local_worker().await;
        worker.register_task("explode", |_job| Err("boom".into()));

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            expect_kind(&mut framed, PacketType::ResetAbilities).await;
            expect_kind(&mut framed, PacketType::CanDo).await;
            expect_kind(&mut framed, PacketType::PreSleep).await;

            framed.send(Packet::empty(PacketType::Noop)).await.unwrap();
            expect_kind(&mut framed, PacketType::GrabJobUniq).await;

            framed
                .send(Packet::new(
                    PacketType::JobAssignUniq,
                    vec![
                        Bytes::from_static(b"H:lap:2"),
                        Bytes::from_static(b"explode"),
                        Bytes::new(),
                        Bytes::new(),
                    ],
                ))
                .await
                .unwrap();

            let fail = expect_kind(&mut framed, PacketType::WorkFail).await;
            assert_eq!(fail.args[0], Bytes::from_static(b"H:lap:2"));
        });

        drive(&mut worker, server).await;
    }

    #[tokio::test]
    async fn test_exception_forwarding() {
        let (mut worker, listener) = local_worker().await;
        worker.set_forward_exceptions(true);
        worker.register_task("explode", |_job| Err("boom".into()));

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            expect_kind(&mut framed, PacketType::ResetAbilities).await;
            expect_kind(&mut framed, PacketType::CanDo).await;
            expect_kind(&mut framed, PacketType::PreSleep).await;

            framed.send(Packet::empty(PacketType::Noop)).await.unwrap();
            expect_kind(&mut framed, PacketType::GrabJobUniq).await;

            framed
                .send(Packet::new(
                    PacketType::JobAssignUniq,
                    vec![
                        Bytes::from_static(b"H:lap:3"),
                        Bytes::from_static(b"explode"),
                        Bytes::new(),
                        Bytes::new(),
                    ],
                ))
                .await
                .unwrap();

            let exception =
                expect_kind(&mut framed, PacketType::WorkException).await;
            assert_eq!(exception.args[1], Bytes::from_static(b"boom"));
            expect_kind(&mut framed, PacketType::WorkFail).await;
        });

        drive(&mut worker, server).await;
    }

    #[tokio::test]
    async fn test_timeout_ability_advertised() {
        let (mut worker, listener) = local_worker().await;
        worker.register_task_with_timeout(
            "slow",
            Duration::from_secs(30),
            |_job| Ok(Bytes::new()),
        );

        let server = tokio::spawn(async move {
            let mut framed = accept(&listener).await;

            expect_kind(&mut framed, PacketType::ResetAbilities).await;
            let can_do =
                expect_kind(&mut framed, PacketType::CanDoTimeout).await;
            assert_eq!(can_do.args[0], Bytes::from_static(b"slow"));
            assert_eq!(can_do.args[1], Bytes::from_static(b"30"));
            expect_kind(&mut framed, PacketType::PreSleep).await;
        });

        drive(&mut worker, server).await;
    }

    #[tokio::test]
    async fn test_no_reachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut worker = Worker::new([ServerSpec::new(
            addr.ip().to_string(),
        )
        .port(addr.port())])
        .unwrap();

        let error = worker
            .work_once(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(error, GearmanError::ServerUnavailable(_)));
    }
}
