//! Typed KRPC messages.
//!
//! Wire encoding and decoding (bencode) is the transport's concern; the
//! engine only ever sees and produces these typed forms.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::common::{Id, NodeContact};
use crate::directory::BloomFilter;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Correlation token chosen by the sender of a request and echoed
    /// verbatim in the response. The sole correlation mechanism.
    pub transaction_id: u16,

    /// The client version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub body: MessageBody,
}

impl Message {
    pub fn request(transaction_id: u16, requester_id: Id, request_type: RequestTypeSpecific) -> Message {
        Message {
            transaction_id,
            version: None,
            body: MessageBody::Request(RequestSpecific {
                requester_id,
                request_type,
            }),
        }
    }

    pub fn response(transaction_id: u16, response: ResponseSpecific) -> Message {
        Message {
            transaction_id,
            version: None,
            body: MessageBody::Response(response),
        }
    }

    pub fn error(transaction_id: u16, code: ErrorCode, description: &str) -> Message {
        Message {
            transaction_id,
            version: None,
            body: MessageBody::Error(ErrorSpecific {
                code: code.code(),
                description: description.to_string(),
            }),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageBody {
    Request(RequestSpecific),
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

/// Error codes from BEP5 and BEP44.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    Generic,
    Server,
    Protocol,
    MethodUnknown,
    MessageTooBig,
    InvalidSignature,
    SaltTooBig,
    CasMismatch,
    SeqLessThanCurrent,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::Server => 202,
            ErrorCode::Protocol => 203,
            ErrorCode::MethodUnknown => 204,
            ErrorCode::MessageTooBig => 205,
            ErrorCode::InvalidSignature => 206,
            ErrorCode::SaltTooBig => 207,
            ErrorCode::CasMismatch => 301,
            ErrorCode::SeqLessThanCurrent => 302,
        }
    }
}

/// Which address families the requester wants closest nodes for.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Want {
    pub v4: bool,
    pub v6: bool,
}

impl Want {
    pub fn both() -> Want {
        Want { v4: true, v6: true }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    GetValue(GetValueRequestArguments),
    Put(PutRequest),
    AnnouncePeer(AnnouncePeerRequestArguments),
    /// A method we don't recognize. Answered with a find_node-style scaffold
    /// to stay compatible with BEP5 extensions, never silently dropped.
    Unknown(UnknownRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
    pub want: Want,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
    pub want: Want,
    /// Exclude seed-only contacts from the sample.
    pub no_seeds: bool,
    /// Request BEP33 scrape Bloom filters.
    pub scrape: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueRequestArguments {
    pub target: Id,
    pub want: Want,
    /// Sequence number the requester already has, if any.
    pub seq: Option<i64>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct PutRequest {
    pub token: Vec<u8>,
    pub value: Bytes,
    /// ed25519 public key; present on mutable items only.
    pub public_key: Option<[u8; 32]>,
    /// ed25519 signature over the signable encoding; mutable items only.
    pub signature: Option<Box<[u8; 64]>>,
    pub seq: Option<i64>,
    /// CAS precondition: the write applies only if the stored sequence
    /// number equals this.
    pub expected_seq: Option<i64>,
    pub salt: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerRequestArguments {
    pub info_hash: Id,
    pub token: Vec<u8>,
    pub port: u16,
    /// Use the UDP source port instead of `port`.
    pub implied_port: bool,
    pub seed: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct UnknownRequestArguments {
    pub target: Option<Id>,
    pub want: Want,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetPeers(GetPeersResponseArguments),
    GetValue(GetValueResponseArguments),
    Put(PutResponseArguments),
    AnnouncePeer(AnnouncePeerResponseArguments),
    Unknown(UnknownResponseArguments),
}

impl ResponseSpecific {
    pub fn responder_id(&self) -> Id {
        match self {
            ResponseSpecific::Ping(args) => args.responder_id,
            ResponseSpecific::FindNode(args) => args.responder_id,
            ResponseSpecific::GetPeers(args) => args.responder_id,
            ResponseSpecific::GetValue(args) => args.responder_id,
            ResponseSpecific::Put(args) => args.responder_id,
            ResponseSpecific::AnnouncePeer(args) => args.responder_id,
            ResponseSpecific::Unknown(args) => args.responder_id,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub values: Vec<SocketAddr>,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
    pub scrape_peers: Option<BloomFilter>,
    pub scrape_seeds: Option<BloomFilter>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
    pub v: Option<Bytes>,
    pub k: Option<[u8; 32]>,
    pub sig: Option<Box<[u8; 64]>>,
    /// Included only for mutable items.
    pub seq: Option<i64>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct PutResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct UnknownResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
}
