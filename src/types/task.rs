use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

pub type CompleteHook = Box<dyn FnMut(&[u8])>;
pub type StatusHook = Box<dyn FnMut(u64, u64)>;
pub type PlainHook = Box<dyn FnMut()>;

/// One unit of batch submission: a function name, an argument, submission
/// flags, and per-lifecycle callback hooks.
///
/// Identity is a fingerprint over the function name and the uniqueness key
/// (`-` means "use the argument"; absent means a random salt, making the
/// task unique within its set). Two tasks with equal fingerprints are the
/// same task; merging them concatenates their hook lists.
pub struct Task {
    pub func: Bytes,
    pub arg: Bytes,
    pub unique: Option<Bytes>,
    pub high_priority: bool,
    pub background: bool,
    pub retry_count: u32,

    pub retries_done: u32,
    pub is_finished: bool,
    pub handle: Option<Bytes>,
    pub result: Option<Bytes>,

    on_complete: Vec<CompleteHook>,
    on_fail: Vec<PlainHook>,
    on_retry: Vec<PlainHook>,
    on_status: Vec<StatusHook>,
    on_post: Vec<PlainHook>,

    fingerprint: u64,
}

impl Task {
    pub fn new(func: impl Into<Bytes>, arg: impl Into<Bytes>) -> Self {
        let func = func.into();
        let arg = arg.into();
        let fingerprint = fingerprint(&func, &arg, None);

        Self {
            func,
            arg,
            unique: None,
            high_priority: false,
            background: false,
            retry_count: 0,
            retries_done: 0,
            is_finished: false,
            handle: None,
            result: None,
            on_complete: Vec::new(),
            on_fail: Vec::new(),
            on_retry: Vec::new(),
            on_status: Vec::new(),
            on_post: Vec::new(),
            fingerprint,
        }
    }

    /// Sets the deduplication key. `-` selects the argument itself.
    pub fn unique(mut self, unique: impl Into<Bytes>) -> Self {
        let unique = unique.into();
        self.fingerprint = fingerprint(&self.func, &self.arg, Some(&unique));
        self.unique = Some(unique);
        self
    }

    pub fn high_priority(mut self, high_priority: bool) -> Self {
        self.high_priority = high_priority;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn on_complete(mut self, hook: impl FnMut(&[u8]) + 'static) -> Self {
        self.on_complete.push(Box::new(hook));
        self
    }

    pub fn on_fail(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_fail.push(Box::new(hook));
        self
    }

    pub fn on_retry(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_retry.push(Box::new(hook));
        self
    }

    pub fn on_status(mut self, hook: impl FnMut(u64, u64) + 'static) -> Self {
        self.on_status.push(Box::new(hook));
        self
    }

    pub fn on_post(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_post.push(Box::new(hook));
        self
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// The uniqueness key submitted on the wire for this task.
    pub fn effective_unique(&self) -> Bytes {
        match &self.unique {
            Some(u) if u.as_ref() == b"-" => self.arg.clone(),
            Some(u) => u.clone(),
            None => Bytes::from(self.fingerprint.to_string()),
        }
    }

    /// Appends the other task's hooks onto this task's per-kind lists.
    pub fn merge_hooks(&mut self, other: Task) {
        self.on_complete.extend(other.on_complete);
        self.on_fail.extend(other.on_fail);
        self.on_retry.extend(other.on_retry);
        self.on_status.extend(other.on_status);
        self.on_post.extend(other.on_post);
    }

    /// Marks the task complete with a result, firing on_complete then
    /// on_post.
    pub fn complete(&mut self, result: Bytes) {
        for hook in &mut self.on_complete {
            hook(&result);
        }
        self.result = Some(result);
        self.finished();
    }

    /// Marks the task failed, firing on_fail then on_post.
    pub fn fail(&mut self) {
        for hook in &mut self.on_fail {
            hook();
        }
        self.finished();
    }

    pub fn status(&mut self, numerator: u64, denominator: u64) {
        for hook in &mut self.on_status {
            hook(numerator, denominator);
        }
    }

    pub fn retrying(&mut self) {
        self.retries_done += 1;
        for hook in &mut self.on_retry {
            hook();
        }
    }

    fn finished(&mut self) {
        self.is_finished = true;
        for hook in &mut self.on_post {
            hook();
        }
        // A finished task never fires again.
        self.on_complete.clear();
        self.on_fail.clear();
        self.on_retry.clear();
        self.on_status.clear();
        self.on_post.clear();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("func", &self.func)
            .field("fingerprint", &self.fingerprint)
            .field("is_finished", &self.is_finished)
            .finish_non_exhaustive()
    }
}

fn fingerprint(func: &Bytes, arg: &Bytes, unique: Option<&Bytes>) -> u64 {
    let mut hasher = DefaultHasher::new();
    func.hash(&mut hasher);
    match unique {
        Some(u) if u.as_ref() == b"-" => arg.hash(&mut hasher),
        Some(u) => u.hash(&mut hasher),
        None => rand::random::<u64>().hash(&mut hasher),
    }
    hasher.finish()
}

/// A set of tasks keyed by fingerprint. Duplicate tasks merge rather than
/// replicate, and the whole set can be cancelled between poll iterations.
#[derive(Debug, Default)]
pub struct Taskset {
    tasks: HashMap<u64, Task>,
    cancelled: bool,
}

impl Taskset {
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut set = Self::default();
        for task in tasks {
            set.add(task);
        }
        set
    }

    /// Inserts a task, merging hooks into an existing task with the same
    /// fingerprint.
    pub fn add(&mut self, task: Task) {
        match self.tasks.entry(task.fingerprint()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().merge_hooks(task);
            },
            Entry::Vacant(slot) => {
                slot.insert(task);
            },
        }
    }

    /// Folds another set into this one, task by task.
    pub fn merge(&mut self, other: Taskset) {
        for (_, task) in other.tasks {
            self.add(task);
        }
    }

    /// Flags the set as cancelled; observed by `submit_taskset` between
    /// frames.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    pub fn task_mut(&mut self, fingerprint: u64) -> Option<&mut Task> {
        self.tasks.get_mut(&fingerprint)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}
