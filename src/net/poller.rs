use std::collections::HashMap;
use std::time::Duration;

use futures::future::{select_all, FutureExt};
use tokio::io::Interest;
use tokio::time::{sleep, timeout};

use super::connection::Connection;
use crate::error::ConnectionError;

/// Readiness events from one poll step, as connection ids.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct PollEvents {
    pub readable: Vec<usize>,
    pub writable: Vec<usize>,
    pub errored: Vec<usize>,
}

impl PollEvents {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty()
            && self.writable.is_empty()
            && self.errored.is_empty()
    }
}

/// Waits for I/O readiness across a set of registered connections.
///
/// Interest is tracked per connection id (the manager's endpoint index).
/// The manager requests write interest only while a connection holds
/// buffered outbound bytes, so an idle connection never reports
/// write-readiness in a busy loop.
#[derive(Debug, Default)]
pub struct Poller {
    interests: HashMap<usize, Interest>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: usize, read: bool, write: bool) {
        match interest(read, write) {
            Some(interest) => {
                self.interests.insert(id, interest);
            },
            None => {
                self.interests.remove(&id);
            },
        }
    }

    pub fn modify(&mut self, id: usize, read: bool, write: bool) {
        self.register(id, read, write);
    }

    pub fn unregister(&mut self, id: usize) {
        self.interests.remove(&id);
    }

    pub fn registered(&self) -> usize {
        self.interests.len()
    }

    /// Waits until at least one registered connection is ready or the
    /// timeout lapses, then reports every connection that is ready at
    /// that moment. Ids without a live connection in `conns` report as
    /// errored.
    pub async fn poll(
        &self,
        conns: &[&Connection],
        poll_timeout: Option<Duration>,
    ) -> PollEvents {
        let mut events = PollEvents::default();

        let mut waits = Vec::with_capacity(self.interests.len());
        for (&id, &interest) in &self.interests {
            match conns.get(id) {
                Some(conn) => waits.push(
                    async move { (id, conn.ready(interest).await) }.boxed_local(),
                ),
                None => events.errored.push(id),
            }
        }

        if waits.is_empty() {
            if events.is_empty() {
                // Nothing to wait on: honor the timeout rather than spin.
                if let Some(t) = poll_timeout {
                    sleep(t).await;
                }
            }
            return events;
        }

        let selected = select_all(waits);
        let (first, _, rest) = match poll_timeout {
            Some(t) => match timeout(t, selected).await {
                Ok(resolved) => resolved,
                Err(_) => return events,
            },
            None => selected.await,
        };

        record(&mut events, first);
        // Collect whichever other connections are ready right now.
        for wait in rest {
            if let Some(resolved) = wait.now_or_never() {
                record(&mut events, resolved);
            }
        }

        events.readable.sort_unstable();
        events.writable.sort_unstable();
        events.errored.sort_unstable();

        events
    }
}

fn record(
    events: &mut PollEvents,
    (id, result): (usize, Result<tokio::io::Ready, ConnectionError>),
) {
    match result {
        Ok(ready) => {
            // A closed read side still routes through the read path so
            // the EOF surfaces as a connection error after any buffered
            // frames are drained.
            if ready.is_readable() || ready.is_read_closed() {
                events.readable.push(id);
            }
            if ready.is_writable() {
                events.writable.push(id);
            }
            // A socket error, or a closed write side with nothing left
            // to read, cannot make progress on either path.
            if ready.is_error()
                || (ready.is_write_closed()
                    && !ready.is_readable()
                    && !ready.is_read_closed())
            {
                events.errored.push(id);
            }
        },
        Err(_) => events.errored.push(id),
    }
}

fn interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
