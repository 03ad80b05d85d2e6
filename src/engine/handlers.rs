//! Incoming request handlers.
//!
//! Every handler runs behind the same guards: requests from ourselves or
//! from bogon sources are dropped silently, the embedder filter gets a veto,
//! and only then does the requester count as a seen contact. A request that
//! later fails (bad token, bad signature) still refreshed the table; the
//! sender is a live node even when its request is garbage.

use std::net::SocketAddr;

use tracing::debug;

use super::{Engine, VERSION};
use crate::common::{
    is_bogon, AddressFamily, Id, NodeContact, PeerContact, MAX_BUCKET_SIZE_K, MAX_SALT_SIZE,
    MAX_VALUE_SIZE,
};
use crate::messages::{
    AnnouncePeerRequestArguments, AnnouncePeerResponseArguments, ErrorCode,
    FindNodeResponseArguments, GetPeersRequestArguments, GetPeersResponseArguments,
    GetValueRequestArguments, GetValueResponseArguments, Message, PingResponseArguments,
    PutRequest, PutResponseArguments, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    UnknownRequestArguments, UnknownResponseArguments, Want,
};
use crate::storage::{hash_immutable, target_from_key, StorageItem, UpdateOutcome};
use crate::transport::EndpointId;

impl Engine {
    pub(super) fn handle_request(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        version: Option<Vec<u8>>,
        request: RequestSpecific,
    ) {
        let Some(id) = self.id else {
            return;
        };
        let requester = request.requester_id;

        if requester == id || is_bogon(&from) {
            self.counters.dropped_requests += 1;
            return;
        }

        if let Some(filter) = self.filter.as_mut() {
            if !filter.allow(from, &request) {
                self.counters.dropped_requests += 1;
                return;
            }
        }

        self.counters.received_requests += 1;
        self.with_table(|table| table.record_seen(requester, from));

        match request.request_type {
            RequestTypeSpecific::Ping => {
                self.reply(
                    endpoint,
                    from,
                    transaction_id,
                    ResponseSpecific::Ping(PingResponseArguments { responder_id: id }),
                );
            }
            RequestTypeSpecific::FindNode(args) => {
                let want = effective_want(args.want, from);
                let (nodes, nodes6) = self.populate_nodes(&args.target, want);

                self.reply(
                    endpoint,
                    from,
                    transaction_id,
                    ResponseSpecific::FindNode(FindNodeResponseArguments {
                        responder_id: id,
                        nodes,
                        nodes6,
                    }),
                );
            }
            RequestTypeSpecific::GetPeers(args) => {
                self.handle_get_peers(endpoint, from, transaction_id, id, requester, args)
            }
            RequestTypeSpecific::GetValue(args) => {
                self.handle_get_value(endpoint, from, transaction_id, id, requester, args)
            }
            RequestTypeSpecific::Put(args) => {
                self.handle_put(endpoint, from, transaction_id, id, requester, args)
            }
            RequestTypeSpecific::AnnouncePeer(args) => self.handle_announce(
                endpoint,
                from,
                transaction_id,
                id,
                requester,
                version,
                args,
            ),
            RequestTypeSpecific::Unknown(args) => {
                self.handle_unknown(endpoint, from, transaction_id, id, requester, args)
            }
        }
    }

    fn handle_get_peers(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        id: Id,
        requester: Id,
        args: GetPeersRequestArguments,
    ) {
        let mut injected: Vec<PeerContact> = Vec::new();
        for observer in self.indexing_observers.iter_mut() {
            injected.extend(observer.lookup_observed(&args.info_hash, from));
        }

        let family = AddressFamily::of(&from);

        // Scrape responses carry two 256 byte filters; halve the peer sample
        // to stay inside the packet budget.
        let mut sample = family.peer_sample_target();
        if args.scrape {
            sample /= 2;
        }

        let mut values: Vec<SocketAddr> = self
            .directory
            .as_ref()
            .map(|directory| directory.sample_peers(&args.info_hash, sample, !args.no_seeds))
            .unwrap_or_default()
            .iter()
            .map(|peer| peer.address())
            .collect();

        // Indexers may know peers we never saw announce; merge them in up to
        // the same budget.
        for peer in injected {
            if values.len() >= sample {
                break;
            }
            if args.no_seeds && peer.is_seed() {
                continue;
            }
            let address = peer.address();
            if !values.contains(&address) {
                values.push(address);
            }
        }

        let (scrape_peers, scrape_seeds) = if args.scrape {
            (
                self.directory
                    .as_ref()
                    .map(|directory| directory.scrape_filter(&args.info_hash, false)),
                self.directory
                    .as_ref()
                    .map(|directory| directory.scrape_filter(&args.info_hash, true)),
            )
        } else {
            (None, None)
        };

        let want = effective_want(args.want, from);

        // A scraping requester wants swarm statistics, not more hops in its
        // own family; drop that node list to make room for the filters.
        let node_want = if args.scrape {
            match family {
                AddressFamily::V4 => Want {
                    v4: false,
                    v6: want.v6,
                },
                AddressFamily::V6 => Want {
                    v4: want.v4,
                    v6: false,
                },
            }
        } else {
            want
        };
        let (nodes, nodes6) = self.populate_nodes(&args.info_hash, node_want);

        let token = self
            .directory
            .as_mut()
            .and_then(|directory| directory.issue_token(&requester, from, &args.info_hash));

        self.reply(
            endpoint,
            from,
            transaction_id,
            ResponseSpecific::GetPeers(GetPeersResponseArguments {
                responder_id: id,
                token,
                values,
                nodes,
                nodes6,
                scrape_peers,
                scrape_seeds,
            }),
        );
    }

    fn handle_get_value(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        id: Id,
        requester: Id,
        args: GetValueRequestArguments,
    ) {
        let token = self
            .directory
            .as_mut()
            .and_then(|directory| directory.issue_token(&requester, from, &args.target));

        let want = effective_want(args.want, from);
        let (nodes, nodes6) = self.populate_nodes(&args.target, want);

        let item = self
            .store
            .as_mut()
            .and_then(|store| store.get(&args.target).cloned());

        let (v, k, sig, seq) = match item {
            None => (None, None, None, None),
            Some(item) if !item.is_mutable() => (Some(item.value().clone()), None, None, None),
            Some(item) => {
                let stored_seq = item.seq();

                // The requester already holds this version or newer; confirm
                // with the sequence number alone.
                let current = matches!(
                    (args.seq, stored_seq),
                    (Some(requested), Some(stored)) if stored <= requested
                );

                if current {
                    (None, None, None, stored_seq)
                } else {
                    (
                        Some(item.value().clone()),
                        item.public_key().copied(),
                        item.signature().map(|sig| Box::new(*sig)),
                        stored_seq,
                    )
                }
            }
        };

        self.reply(
            endpoint,
            from,
            transaction_id,
            ResponseSpecific::GetValue(GetValueResponseArguments {
                responder_id: id,
                token,
                nodes,
                nodes6,
                v,
                k,
                sig,
                seq,
            }),
        );
    }

    fn handle_put(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        id: Id,
        requester: Id,
        args: PutRequest,
    ) {
        if args.value.len() > MAX_VALUE_SIZE {
            self.reply_error(
                endpoint,
                from,
                transaction_id,
                ErrorCode::MessageTooBig,
                "Message (v field) too big",
            );
            return;
        }

        if args.salt.as_ref().map(|salt| salt.len()).unwrap_or(0) > MAX_SALT_SIZE {
            self.reply_error(
                endpoint,
                from,
                transaction_id,
                ErrorCode::SaltTooBig,
                "Salt (salt field) too big",
            );
            return;
        }

        let target = match args.public_key {
            Some(ref public_key) => target_from_key(public_key, args.salt.as_deref()),
            None => hash_immutable(&args.value).into(),
        };

        let valid_token = self
            .directory
            .as_mut()
            .map(|directory| directory.validate_token(&args.token, &requester, from, &target))
            .unwrap_or(false);
        if !valid_token {
            self.reply_error(
                endpoint,
                from,
                transaction_id,
                ErrorCode::Protocol,
                "Invalid or expired token",
            );
            return;
        }

        let item = StorageItem::from(&args);
        let outcome = self
            .store
            .as_mut()
            .map(|store| store.put_cas(target, item, args.expected_seq))
            .unwrap_or(UpdateOutcome::Success);

        match outcome {
            UpdateOutcome::Success => {
                self.reply(
                    endpoint,
                    from,
                    transaction_id,
                    ResponseSpecific::Put(PutResponseArguments { responder_id: id }),
                );
            }
            UpdateOutcome::CasFail => {
                self.reply_error(
                    endpoint,
                    from,
                    transaction_id,
                    ErrorCode::CasMismatch,
                    "CAS mismatch, re-read value and try again",
                );
            }
            UpdateOutcome::SigFail => {
                self.reply_error(
                    endpoint,
                    from,
                    transaction_id,
                    ErrorCode::InvalidSignature,
                    "Invalid signature",
                );
            }
            UpdateOutcome::SeqFail => {
                self.reply_error(
                    endpoint,
                    from,
                    transaction_id,
                    ErrorCode::SeqLessThanCurrent,
                    "Sequence number less than current",
                );
            }
            UpdateOutcome::ImmutableSubstitutionFail => {
                self.reply_error(
                    endpoint,
                    from,
                    transaction_id,
                    ErrorCode::Protocol,
                    "Cannot overwrite a mutable item with an immutable one",
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_announce(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        id: Id,
        requester: Id,
        version: Option<Vec<u8>>,
        args: AnnouncePeerRequestArguments,
    ) {
        let valid_token = self
            .directory
            .as_mut()
            .map(|directory| directory.validate_token(&args.token, &requester, from, &args.info_hash))
            .unwrap_or(false);
        if !valid_token {
            self.reply_error(
                endpoint,
                from,
                transaction_id,
                ErrorCode::Protocol,
                "Invalid or expired token",
            );
            return;
        }

        let port = if args.implied_port || args.port == 0 {
            from.port()
        } else {
            args.port
        };
        let address = SocketAddr::new(from.ip(), port);

        if is_bogon(&address) {
            debug!(%address, "Ignoring announce for a bogon address");
        } else {
            let mut peer = PeerContact::new(address, args.seed);
            if let Some(version) = version {
                peer = peer.with_version(version);
            }

            for observer in self.indexing_observers.iter_mut() {
                observer.announce_observed(&args.info_hash, &peer);
            }

            if let Some(directory) = self.directory.as_mut() {
                directory.store_peer(args.info_hash, peer);
            }
        }

        // Announcing to a bogon address is the announcer's problem, not a
        // protocol violation; acknowledge either way.
        self.reply(
            endpoint,
            from,
            transaction_id,
            ResponseSpecific::AnnouncePeer(AnnouncePeerResponseArguments { responder_id: id }),
        );
    }

    /// Unrecognized methods get a find_node style answer so extension
    /// methods still make progress through us.
    fn handle_unknown(
        &mut self,
        endpoint: EndpointId,
        from: SocketAddr,
        transaction_id: u16,
        id: Id,
        requester: Id,
        args: UnknownRequestArguments,
    ) {
        let target = args.target.unwrap_or(requester);
        let want = effective_want(args.want, from);
        let (nodes, nodes6) = self.populate_nodes(&target, want);

        self.reply(
            endpoint,
            from,
            transaction_id,
            ResponseSpecific::Unknown(UnknownResponseArguments {
                responder_id: id,
                nodes,
                nodes6,
            }),
        );
    }

    /// Closest nodes per requested family, each served by the engine of that
    /// family through the sibling registry. A family with no registered
    /// engine yields an empty list.
    fn populate_nodes(&self, target: &Id, want: Want) -> (Vec<NodeContact>, Vec<NodeContact>) {
        let nodes = if want.v4 {
            self.siblings
                .closest(AddressFamily::V4, target, MAX_BUCKET_SIZE_K)
        } else {
            Vec::new()
        };

        let nodes6 = if want.v6 {
            self.siblings
                .closest(AddressFamily::V6, target, MAX_BUCKET_SIZE_K)
        } else {
            Vec::new()
        };

        (nodes, nodes6)
    }

    fn reply(
        &mut self,
        endpoint: EndpointId,
        to: SocketAddr,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let mut message = Message::response(transaction_id, response);
        message.version = Some(VERSION.to_vec());

        if let Some(transport) = self.transport.as_mut() {
            transport.send(endpoint, to, message);
            self.counters.sent_responses += 1;
        }
    }

    fn reply_error(
        &mut self,
        endpoint: EndpointId,
        to: SocketAddr,
        transaction_id: u16,
        code: ErrorCode,
        description: &str,
    ) {
        let mut message = Message::error(transaction_id, code, description);
        message.version = Some(VERSION.to_vec());

        if let Some(transport) = self.transport.as_mut() {
            transport.send(endpoint, to, message);
            self.counters.sent_errors += 1;
        }
    }
}

/// BEP32: a request without an explicit `want` gets nodes of its own family.
fn effective_want(want: Want, from: SocketAddr) -> Want {
    if want.v4 || want.v6 {
        return want;
    }

    match AddressFamily::of(&from) {
        AddressFamily::V4 => Want { v4: true, v6: false },
        AddressFamily::V6 => Want { v4: false, v6: true },
    }
}
