//! Thread-backed node: owns an [Engine] on its own actor thread.
//!
//! The engine itself is single threaded by design; this wrapper gives it a
//! thread, feeds it transport events, ticks it regularly and answers queries
//! over a command channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use tracing::error;

use crate::common::Id;
use crate::engine::{Engine, Stats};
use crate::scheduler::{TaskId, TaskScheduler};
use crate::transport::{RpcTransport, TransportEvent};
use crate::{Error, Result};

/// How long the actor blocks waiting for an event before running a tick.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum Command {
    Id(flume::Sender<Option<Id>>),
    Stats(flume::Sender<Stats>),
    Shutdown,
}

/// Handle to an engine running on its own thread. Dropping the handle shuts
/// the engine down and joins the thread.
#[derive(Debug)]
pub struct Node {
    commands: flume::Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Node {
    /// Start the engine and move it onto a new thread that drains `events`.
    pub fn spawn(
        mut engine: Engine,
        transport: Box<dyn RpcTransport>,
        scheduler: Box<dyn TaskScheduler>,
        completions: flume::Receiver<TaskId>,
        events: flume::Receiver<TransportEvent>,
    ) -> Result<Node> {
        engine.start(transport, scheduler, completions)?;

        let (sender, receiver) = flume::unbounded();

        let handle = Builder::new()
            .name(format!("kadnode-{}", engine.config().family()))
            .spawn(move || run(engine, receiver, events))?;

        Ok(Node {
            commands: sender,
            handle: Some(handle),
        })
    }

    /// The node id of the engine.
    pub fn id(&self) -> Result<Option<Id>> {
        let (sender, receiver) = flume::bounded(1);

        self.commands
            .send(Command::Id(sender))
            .map_err(|_| Error::NotRunning)?;

        receiver.recv().map_err(|_| Error::NotRunning)
    }

    /// A snapshot of the engine's statistics.
    pub fn stats(&self) -> Result<Stats> {
        let (sender, receiver) = flume::bounded(1);

        self.commands
            .send(Command::Stats(sender))
            .map_err(|_| Error::NotRunning)?;

        receiver.recv().map_err(|_| Error::NotRunning)
    }

    /// Stop the engine and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut engine: Engine, commands: flume::Receiver<Command>, events: flume::Receiver<TransportEvent>) {
    'actor: loop {
        for command in commands.try_iter() {
            match command {
                Command::Id(reply) => {
                    let _ = reply.send(engine.id());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(engine.stats());
                }
                Command::Shutdown => break 'actor,
            }
        }

        match events.recv_timeout(TICK_INTERVAL) {
            Ok(event) => engine.handle_event(event),
            Err(flume::RecvTimeoutError::Timeout) => {}
            // The transport side is gone; nothing left to serve.
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        // A panicking tick must not take the serving loop down with it.
        if catch_unwind(AssertUnwindSafe(|| engine.tick())).is_err() {
            error!("Engine tick panicked");
        }
    }

    engine.stop();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::AddressFamily;
    use crate::config::Config;
    use crate::messages::{Message, MessageBody, RequestTypeSpecific};
    use crate::scheduler::TaskQueue;
    use crate::transport::{ChannelTransport, EndpointId};

    fn spawn_node() -> (
        Node,
        flume::Sender<TransportEvent>,
        flume::Receiver<crate::transport::Outbound>,
    ) {
        let engine = Engine::new(Config::new(AddressFamily::V4).without_router_bootstrap());
        let (transport, outbound) = ChannelTransport::new(vec![Id::random()]);
        let (queue, _driver, completions) = TaskQueue::new();
        let (events_sender, events_receiver) = flume::unbounded();

        let node = Node::spawn(
            engine,
            Box::new(transport),
            Box::new(queue),
            completions,
            events_receiver,
        )
        .expect("spawn");

        (node, events_sender, outbound)
    }

    #[test]
    fn answers_pings_from_its_own_thread() {
        let (mut node, events, outbound) = spawn_node();

        events
            .send(TransportEvent::Incoming {
                endpoint: EndpointId(0),
                from: ([93, 184, 216, 34], 6881).into(),
                message: Message::request(42, Id::random(), RequestTypeSpecific::Ping),
            })
            .expect("send");

        let reply = outbound
            .recv_timeout(Duration::from_secs(5))
            .expect("a pong");
        assert_eq!(reply.message.transaction_id, 42);
        assert!(matches!(reply.message.body, MessageBody::Response(_)));

        let stats = node.stats().expect("stats");
        assert_eq!(stats.received_requests, 1);
        assert_eq!(stats.table_size, 1);

        node.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut node, _events, _outbound) = spawn_node();

        assert!(node.id().expect("id").is_some());

        node.shutdown();
        node.shutdown();

        assert!(node.id().is_err());
    }
}
