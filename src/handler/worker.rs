use bytes::Bytes;

use super::{server_error, CommandHandler};
use crate::error::GearmanError;
use crate::net::connection::Connection;
use crate::types::job::Job;
use crate::wire::protocol::{Packet, PacketType};

/// An ability this worker advertises, with an optional execution timeout
/// in seconds (CAN_DO vs CAN_DO_TIMEOUT).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ability {
    pub name: Bytes,
    pub timeout: Option<u64>,
}

/// Worker-role state machine for one connection.
///
/// Drives the sleep cycle: PRE_SLEEP parks the worker until the server's
/// NOOP, which triggers a single GRAB_JOB_UNIQ. The server answers with
/// NO_JOB (sleep again) or a JOB_ASSIGN[_UNIQ], which is parked for the
/// manager to execute; user code never runs on the dispatch path. At most
/// one GRAB is outstanding per connection.
#[derive(Debug, Default)]
pub struct WorkerHandler {
    abilities: Vec<Ability>,
    client_id: Option<Bytes>,
    sleeping: bool,
    awaiting_grab: bool,
    assigned: Option<Job>,
}

impl WorkerHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn has_outstanding_grab(&self) -> bool {
        self.awaiting_grab
    }

    /// Takes the job the server assigned, if any. The manager runs it and
    /// reports the outcome on the same connection.
    pub fn take_assigned_job(&mut self) -> Option<Job> {
        self.assigned.take()
    }

    /// Records an ability and advertises it when the connection is live.
    pub fn add_ability(
        &mut self,
        conn: &mut Connection,
        name: Bytes,
        timeout: Option<u64>,
    ) {
        self.abilities.retain(|a| a.name != name);
        self.abilities.push(Ability { name: name.clone(), timeout });

        if conn.connected() {
            conn.send_command(can_do(&Ability { name, timeout }));
        }
    }

    /// Withdraws an ability, telling a live server it is gone.
    pub fn remove_ability(&mut self, conn: &mut Connection, name: &[u8]) {
        self.abilities.retain(|a| a.name != name);

        if conn.connected() {
            conn.send_command(Packet::new(
                PacketType::CantDo,
                vec![Bytes::copy_from_slice(name)],
            ));
        }
    }

    /// Sets the identity shown in the admin `workers` listing.
    pub fn set_client_id(&mut self, conn: &mut Connection, client_id: Bytes) {
        self.client_id = Some(client_id.clone());

        if conn.connected() {
            conn.send_command(Packet::new(
                PacketType::SetClientId,
                vec![client_id],
            ));
        }
    }

    /// Requests another job unless one is already outstanding or waiting
    /// to be executed.
    pub fn grab_next(&mut self, conn: &mut Connection) {
        if self.awaiting_grab || self.assigned.is_some() {
            return;
        }

        conn.send_command(Packet::empty(PacketType::GrabJobUniq));
        self.awaiting_grab = true;
        self.sleeping = false;
    }

    fn go_to_sleep(&mut self, conn: &mut Connection) {
        conn.send_command(Packet::empty(PacketType::PreSleep));
        self.sleeping = true;
    }

    fn recv_noop(&mut self, conn: &mut Connection) {
        // Spurious NOOPs while a grab or job is in flight are dropped to
        // keep the one-outstanding-GRAB invariant.
        if self.sleeping {
            self.grab_next(conn);
        }
    }

    fn recv_no_job(&mut self, conn: &mut Connection) {
        self.awaiting_grab = false;
        self.go_to_sleep(conn);
    }

    fn recv_job_assign(
        &mut self,
        handle: Bytes,
        task: Bytes,
        unique: Bytes,
        data: Bytes,
    ) -> Result<(), GearmanError> {
        if self.assigned.is_some() {
            return Err(GearmanError::InvalidClientState(String::from(
                "received a job assignment while one is already pending",
            )));
        }

        self.awaiting_grab = false;
        self.assigned = Some(Job::new(handle, task, unique, data, None));

        Ok(())
    }
}

impl CommandHandler for WorkerHandler {
    fn on_connect(
        &mut self,
        conn: &mut Connection,
    ) -> Result<(), GearmanError> {
        self.sleeping = false;
        self.awaiting_grab = false;
        self.assigned = None;

        if let Some(client_id) = &self.client_id {
            conn.send_command(Packet::new(
                PacketType::SetClientId,
                vec![client_id.clone()],
            ));
        }

        conn.send_command(Packet::empty(PacketType::ResetAbilities));
        for ability in &self.abilities {
            conn.send_command(can_do(ability));
        }

        self.go_to_sleep(conn);

        Ok(())
    }

    fn on_disconnect(&mut self) {
        self.sleeping = false;
        self.awaiting_grab = false;
        self.assigned = None;
    }

    fn recv_packet(
        &mut self,
        conn: &mut Connection,
        packet: Packet,
    ) -> Result<(), GearmanError> {
        match packet.kind {
            PacketType::Noop => {
                packet.expect_args::<0>()?;
                self.recv_noop(conn);
                Ok(())
            },
            PacketType::NoJob => {
                packet.expect_args::<0>()?;
                self.recv_no_job(conn);
                Ok(())
            },
            PacketType::JobAssignUniq => {
                let [handle, task, unique, data] = packet.expect_args::<4>()?;
                self.recv_job_assign(
                    handle.clone(),
                    task.clone(),
                    unique.clone(),
                    data.clone(),
                )
            },
            PacketType::JobAssign => {
                let [handle, task, data] = packet.expect_args::<3>()?;
                self.recv_job_assign(
                    handle.clone(),
                    task.clone(),
                    Bytes::new(),
                    data.clone(),
                )
            },
            PacketType::Error => Err(server_error(&packet)),
            kind => Err(GearmanError::InvalidClientState(format!(
                "worker received unexpected {kind}"
            ))),
        }
    }
}

fn can_do(ability: &Ability) -> Packet {
    match ability.timeout {
        Some(timeout) => Packet::new(
            PacketType::CanDoTimeout,
            vec![
                ability.name.clone(),
                Bytes::from(timeout.to_string()),
            ],
        ),
        None => Packet::new(PacketType::CanDo, vec![ability.name.clone()]),
    }
}
