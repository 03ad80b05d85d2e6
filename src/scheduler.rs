//! The seam between the engine and iterative lookup execution.
//!
//! The engine decides *when* a node lookup should happen (bootstrap, bucket
//! filling, periodic self lookups) but never walks the iterative lookup
//! itself. It enqueues work here; a driver pops it, runs the lookup, and
//! reports completion back over a channel.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::common::Id;
use crate::transport::EndpointId;

/// Handle for a scheduled lookup, used to correlate completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Jumps the queue. Bootstrap lookups run at this priority.
    High,
}

/// A node lookup the engine wants executed.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLookup {
    pub endpoint: EndpointId,
    pub target: Id,
    /// Addresses to seed the lookup with when the routing table alone is
    /// too sparse, typically resolved bootstrap routers.
    pub seeds: Vec<SocketAddr>,
}

pub trait TaskScheduler: Send + Debug {
    fn enqueue(&mut self, lookup: NodeLookup, priority: Priority) -> TaskId;

    /// Drop everything not yet picked up. Called on engine stop.
    fn cancel_all(&mut self);

    fn pending(&self) -> usize;
}

#[derive(Debug)]
struct Shared {
    next_id: u64,
    queue: VecDeque<(TaskId, NodeLookup)>,
}

/// Default [TaskScheduler]: a shared priority queue drained by a
/// [TaskDriver] on the lookup side.
#[derive(Debug)]
pub struct TaskQueue {
    shared: Arc<Mutex<Shared>>,
}

/// The consumer half of a [TaskQueue].
#[derive(Debug, Clone)]
pub struct TaskDriver {
    shared: Arc<Mutex<Shared>>,
    completions: flume::Sender<TaskId>,
}

impl TaskQueue {
    /// Returns the scheduler, its driver, and the channel completions arrive
    /// on. The engine keeps the scheduler and the receiver; whatever executes
    /// lookups keeps the driver.
    pub fn new() -> (TaskQueue, TaskDriver, flume::Receiver<TaskId>) {
        let shared = Arc::new(Mutex::new(Shared {
            next_id: 0,
            queue: VecDeque::new(),
        }));
        let (sender, receiver) = flume::unbounded();

        (
            TaskQueue {
                shared: shared.clone(),
            },
            TaskDriver {
                shared,
                completions: sender,
            },
            receiver,
        )
    }
}

impl TaskScheduler for TaskQueue {
    fn enqueue(&mut self, lookup: NodeLookup, priority: Priority) -> TaskId {
        let mut shared = lock(&self.shared);

        let id = TaskId(shared.next_id);
        shared.next_id += 1;

        match priority {
            Priority::High => shared.queue.push_front((id, lookup)),
            Priority::Normal => shared.queue.push_back((id, lookup)),
        }

        id
    }

    fn cancel_all(&mut self) {
        lock(&self.shared).queue.clear();
    }

    fn pending(&self) -> usize {
        lock(&self.shared).queue.len()
    }
}

impl TaskDriver {
    /// Pop the next lookup to run, highest priority first.
    pub fn next(&self) -> Option<(TaskId, NodeLookup)> {
        lock(&self.shared).queue.pop_front()
    }

    /// Report a lookup as finished, successfully or not.
    pub fn complete(&self, id: TaskId) {
        // The engine dropping its receiver just means nobody is waiting.
        let _ = self.completions.send(id);
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
