use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tokio::time::Instant;

/// Queue priority of a submitted job. Combined with the background flag
/// this selects one of the six SUBMIT_JOB opcodes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Priority {
    #[default]
    None,
    Low,
    High,
}

/// Client-observed lifecycle of a job request.
///
/// `Unknown` → `Pending` (submission sent) → `Created` (JOB_CREATED
/// received) → `Complete` | `Failed`. A connection loss while retryable
/// returns the request to `Unknown`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JobState {
    #[default]
    Unknown,
    Pending,
    Created,
    Complete,
    Failed,
}

/// One unit of work as both sides see it: the server-assigned handle, the
/// function name, the deduplication key, and the opaque payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    pub handle: Bytes,
    pub task: Bytes,
    pub unique: Bytes,
    pub data: Bytes,
    /// Pool index of the connection this job lives on, if any.
    pub connection: Option<usize>,
}

impl Job {
    pub fn new(
        handle: Bytes,
        task: Bytes,
        unique: Bytes,
        data: Bytes,
        connection: Option<usize>,
    ) -> Self {
        Self { handle, task, unique, data, connection }
    }
}

/// The most recent STATUS_RES / WORK_STATUS view of a job.
#[derive(Clone, Debug, Default)]
pub struct JobStatus {
    pub handle: Bytes,
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
    /// Set when a STATUS_RES frame arrives; `get_job_status` polls until
    /// it flips from `None`.
    pub time_received: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct RequestState {
    pub job: Job,
    pub priority: Priority,
    pub background: bool,
    pub state: JobState,
    pub result: Option<Bytes>,
    pub data_updates: VecDeque<Bytes>,
    pub warning_updates: VecDeque<Bytes>,
    pub status: JobStatus,
    pub timed_out: bool,
    pub connection_attempts: u32,
    pub max_connection_attempts: u32,
    pub max_retries: u32,
    pub retries: u32,
    /// Saved candidate-connection rotation for this request; filled on the
    /// first `establish_request_connection` and resumed afterwards.
    pub rotation: Option<VecDeque<usize>>,
}

/// A client-side job request: a [Job] plus submission options and the
/// state the command handler mutates as frames arrive.
///
/// Cloning is shallow; the manager, the handler maps, and the caller all
/// observe the same underlying state. The library is single-threaded per
/// manager, so shared ownership is `Rc`-based with no locking.
#[derive(Clone, Debug)]
pub struct JobRequest {
    inner: Rc<RefCell<RequestState>>,
}

impl JobRequest {
    pub fn new(
        job: Job,
        priority: Priority,
        background: bool,
        max_connection_attempts: u32,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RequestState {
                job,
                priority,
                background,
                state: JobState::Unknown,
                result: None,
                data_updates: VecDeque::new(),
                warning_updates: VecDeque::new(),
                status: JobStatus::default(),
                timed_out: false,
                connection_attempts: 0,
                max_connection_attempts,
                max_retries: 0,
                retries: 0,
                rotation: None,
            })),
        }
    }

    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut RequestState) -> R,
    ) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Two handles are the same request iff they share state.
    pub fn is_same(&self, other: &JobRequest) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> JobState {
        self.inner.borrow().state
    }

    pub fn priority(&self) -> Priority {
        self.inner.borrow().priority
    }

    pub fn background(&self) -> bool {
        self.inner.borrow().background
    }

    pub fn job_handle(&self) -> Bytes {
        self.inner.borrow().job.handle.clone()
    }

    pub fn task(&self) -> Bytes {
        self.inner.borrow().job.task.clone()
    }

    pub fn unique(&self) -> Bytes {
        self.inner.borrow().job.unique.clone()
    }

    pub fn data(&self) -> Bytes {
        self.inner.borrow().job.data.clone()
    }

    /// The WORK_COMPLETE payload; set iff the request completed.
    pub fn result(&self) -> Option<Bytes> {
        self.inner.borrow().result.clone()
    }

    /// Whether this request has reached a state the caller need not wait
    /// beyond: a terminal state for foreground requests, acceptance for
    /// background requests (no further updates will follow).
    pub fn complete(&self) -> bool {
        let inner = self.inner.borrow();
        if inner.background {
            inner.state == JobState::Created
        } else {
            matches!(inner.state, JobState::Complete | JobState::Failed)
        }
    }

    pub fn timed_out(&self) -> bool {
        self.inner.borrow().timed_out
    }

    pub fn status(&self) -> JobStatus {
        self.inner.borrow().status.clone()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.inner.borrow().connection_attempts
    }

    pub fn max_connection_attempts(&self) -> u32 {
        self.inner.borrow().max_connection_attempts
    }

    /// Next streamed WORK_DATA chunk, in arrival order.
    pub fn pop_data_update(&self) -> Option<Bytes> {
        self.inner.borrow_mut().data_updates.pop_front()
    }

    /// Next streamed WORK_WARNING chunk, in arrival order.
    pub fn pop_warning_update(&self) -> Option<Bytes> {
        self.inner.borrow_mut().warning_updates.pop_front()
    }

    /// Returns the request to a just-constructed, resubmittable state.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.state = JobState::Unknown;
        inner.timed_out = false;
        inner.result = None;
        inner.job.connection = None;
    }
}
