//! The transport seam between the engine and the wire.
//!
//! The engine never touches sockets. Whatever moves packets feeds it
//! [TransportEvent]s and implements [RpcTransport] for the reply direction,
//! so the whole request path runs the same way under a UDP socket or a test
//! harness.

use std::fmt::Debug;
use std::net::SocketAddr;

use crate::common::Id;
use crate::messages::Message;

/// Identifies one local endpoint (bound address) of the transport. A
/// multihomed node runs several endpoints of the same address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub usize);

/// An outgoing call that expired without a response.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub to: SocketAddr,
    /// The id we expected to answer, when the call targeted a known node.
    pub expected_id: Option<Id>,
}

/// What the transport reports up to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded datagram from the wire.
    Incoming {
        endpoint: EndpointId,
        from: SocketAddr,
        message: Message,
    },
    /// An outgoing call timed out.
    Timeout { endpoint: EndpointId, call: CallInfo },
}

/// The engine's handle on the wire.
pub trait RpcTransport: Send + Debug {
    /// The local endpoints currently bound.
    fn endpoints(&self) -> Vec<EndpointId>;

    /// The id derived for an endpoint, distinct per bound address so each
    /// endpoint maintains its own neighborhood.
    fn derived_id(&self, endpoint: EndpointId) -> Option<Id>;

    /// Hand a message to the wire. Encoding and socket errors stay below
    /// this seam; a lost packet surfaces later as a timeout, not here.
    fn send(&mut self, endpoint: EndpointId, to: SocketAddr, message: Message);

    /// Number of requests awaiting a response on an endpoint. Used by
    /// maintenance to pick idle endpoints for liveness pings.
    fn active_calls(&self, endpoint: EndpointId) -> usize;
}

/// An outgoing message captured by [ChannelTransport].
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub endpoint: EndpointId,
    pub to: SocketAddr,
    pub message: Message,
}

/// Channel-backed [RpcTransport]. Sends go out over a flume channel for a
/// socket driver (or a test) to drain.
#[derive(Debug)]
pub struct ChannelTransport {
    endpoints: Vec<Endpoint>,
    outbound: flume::Sender<Outbound>,
}

#[derive(Debug)]
struct Endpoint {
    derived_id: Id,
    active_calls: usize,
}

impl ChannelTransport {
    /// Create a transport with one endpoint per derived id, plus the receiver
    /// end of its outbound channel.
    pub fn new(derived_ids: Vec<Id>) -> (ChannelTransport, flume::Receiver<Outbound>) {
        let (sender, receiver) = flume::unbounded();

        let transport = ChannelTransport {
            endpoints: derived_ids
                .into_iter()
                .map(|derived_id| Endpoint {
                    derived_id,
                    active_calls: 0,
                })
                .collect(),
            outbound: sender,
        };

        (transport, receiver)
    }

    /// Record that a call previously counted by [RpcTransport::send] got a
    /// response or timed out.
    pub fn call_finished(&mut self, endpoint: EndpointId) {
        if let Some(endpoint) = self.endpoints.get_mut(endpoint.0) {
            endpoint.active_calls = endpoint.active_calls.saturating_sub(1);
        }
    }
}

impl RpcTransport for ChannelTransport {
    fn endpoints(&self) -> Vec<EndpointId> {
        (0..self.endpoints.len()).map(EndpointId).collect()
    }

    fn derived_id(&self, endpoint: EndpointId) -> Option<Id> {
        self.endpoints.get(endpoint.0).map(|e| e.derived_id)
    }

    fn send(&mut self, endpoint: EndpointId, to: SocketAddr, message: Message) {
        if let Some(state) = self.endpoints.get_mut(endpoint.0) {
            if matches!(message.body, crate::messages::MessageBody::Request(_)) {
                state.active_calls += 1;
            }
        }

        // A full or disconnected channel means the driver is gone; the
        // packet is as lost as one dropped by the network.
        let _ = self.outbound.send(Outbound {
            endpoint,
            to,
            message,
        });
    }

    fn active_calls(&self, endpoint: EndpointId) -> usize {
        self.endpoints
            .get(endpoint.0)
            .map(|e| e.active_calls)
            .unwrap_or(0)
    }
}
