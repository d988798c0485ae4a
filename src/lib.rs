//! A client, worker, and admin library for the Gearman job-queue
//! protocol.
//!
//! Three managers cover the protocol's roles:
//!
//! * [Client] submits jobs to one or more servers and tracks them to
//!   completion, rotating across servers on connection failure.
//! * [Worker] registers abilities and executes assigned jobs, streaming
//!   progress back to the submitter.
//! * [AdminClient] drives the line-oriented admin channel of a single
//!   server (status, workers, shutdown, and friends).
//!
//! Each manager owns its connections outright and multiplexes them on a
//! single task: high-level calls run the event loop inline until their
//! result is ready or the caller's deadline lapses. The wire codec and
//! the per-role state machines live in [wire] and [handler] and can be
//! reused on their own, e.g. through [wire::framed].

pub mod error;
pub mod handler;
pub mod manager;
pub mod net;
pub mod types;
pub mod wire;

pub use error::{ConnectionError, GearmanError, ProtocolError};
pub use handler::admin::{
    AdminResponse, JobEntry, StatusEntry, WorkerEntry, ECHO_STRING,
};
pub use manager::admin::AdminClient;
pub use manager::client::{Client, JobSubmission, SubmitOptions};
pub use manager::worker::{ActiveJob, TaskResult, Worker};
pub use manager::ServerSpec;
pub use net::connection::{Connection, DEFAULT_PORT};
pub use types::job::{Job, JobRequest, JobState, JobStatus, Priority};
pub use types::task::{Task, Taskset};
