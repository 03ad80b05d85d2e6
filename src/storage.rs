//! BEP44 value storage with compare-and-swap semantics.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lru::LruCache;
use sha1_smol::Sha1;
use tracing::trace;

use crate::common::{Id, ID_SIZE, VALUE_RETENTION};
use crate::messages::PutRequest;

/// Default maximum number of stored values.
pub const MAX_VALUES: usize = 1000;

/// A stored BEP44 item; immutable (content addressed) or mutable (public key
/// addressed, versioned by a signed sequence number).
#[derive(Debug, Clone, PartialEq)]
pub struct StorageItem {
    value: Bytes,
    public_key: Option<[u8; 32]>,
    signature: Option<Box<[u8; 64]>>,
    salt: Option<Vec<u8>>,
    seq: Option<i64>,
}

impl StorageItem {
    pub fn immutable(value: Bytes) -> StorageItem {
        StorageItem {
            value,
            public_key: None,
            signature: None,
            salt: None,
            seq: None,
        }
    }

    pub fn mutable(
        value: Bytes,
        public_key: [u8; 32],
        signature: Box<[u8; 64]>,
        seq: i64,
        salt: Option<Vec<u8>>,
    ) -> StorageItem {
        StorageItem {
            value,
            public_key: Some(public_key),
            signature: Some(signature),
            salt,
            seq: Some(seq),
        }
    }

    // === Getters ===

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        self.public_key.as_ref()
    }

    pub fn signature(&self) -> Option<&[u8; 64]> {
        self.signature.as_deref()
    }

    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Sequence number; `None` for immutable items.
    pub fn seq(&self) -> Option<i64> {
        self.seq
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    /// The key this item is stored under: SHA-1 of the bencoded value for
    /// immutable items, SHA-1 of public key + salt for mutable ones.
    pub fn derive_target(&self) -> Id {
        match self.public_key {
            Some(ref public_key) => target_from_key(public_key, self.salt.as_deref()),
            None => hash_immutable(&self.value).into(),
        }
    }

    fn verify_signature(&self) -> bool {
        let (Some(public_key), Some(signature), Some(seq)) =
            (self.public_key, self.signature.as_deref(), self.seq)
        else {
            return false;
        };

        let Ok(key) = VerifyingKey::from_bytes(&public_key) else {
            return false;
        };

        let signature = Signature::from_bytes(signature);
        let signable = encode_signable(seq, &self.value, self.salt.as_deref());

        key.verify(&signable, &signature).is_ok()
    }
}

impl From<&PutRequest> for StorageItem {
    fn from(request: &PutRequest) -> StorageItem {
        StorageItem {
            value: request.value.clone(),
            public_key: request.public_key,
            signature: request.signature.clone(),
            salt: request.salt.clone(),
            seq: request.seq,
        }
    }
}

/// Outcome of a compare-and-swap write. Matched exhaustively by the put
/// handler; every variant maps to exactly one wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    /// The expected-sequence precondition did not match the stored sequence.
    CasFail,
    /// The signature does not verify against the declared public key.
    SigFail,
    /// The supplied sequence number is less than the stored one.
    SeqFail,
    /// An immutable write tried to replace an existing mutable item.
    ImmutableSubstitutionFail,
}

#[derive(Debug)]
struct StoredEntry {
    item: StorageItem,
    stored_at: Instant,
}

/// In-memory BEP44 store. Writes go through [ValueStore::put_cas], which is
/// the serialization point for concurrent puts to the same key.
#[derive(Debug)]
pub struct ValueStore {
    items: LruCache<Id, StoredEntry>,
    retention: Duration,
}

impl ValueStore {
    pub fn new(capacity: NonZeroUsize) -> ValueStore {
        ValueStore {
            items: LruCache::new(capacity),
            retention: VALUE_RETENTION,
        }
    }

    pub fn get(&mut self, key: &Id) -> Option<&StorageItem> {
        self.items.get(key).map(|entry| &entry.item)
    }

    /// Conditional write. Checks run in a fixed order against a consistent
    /// snapshot of the stored entry; nothing is mutated unless the outcome is
    /// [UpdateOutcome::Success].
    pub fn put_cas(
        &mut self,
        key: Id,
        item: StorageItem,
        expected_seq: Option<i64>,
    ) -> UpdateOutcome {
        if item.is_mutable() && !item.verify_signature() {
            return UpdateOutcome::SigFail;
        }

        if let Some(previous) = self.items.peek(&key) {
            let previous = &previous.item;

            if previous.is_mutable() {
                if !item.is_mutable() {
                    return UpdateOutcome::ImmutableSubstitutionFail;
                }

                if let Some(expected) = expected_seq {
                    if previous.seq != Some(expected) {
                        return UpdateOutcome::CasFail;
                    }
                }

                if item.seq < previous.seq {
                    return UpdateOutcome::SeqFail;
                }
            }
        }

        self.items.put(
            key,
            StoredEntry {
                item,
                stored_at: Instant::now(),
            },
        );

        UpdateOutcome::Success
    }

    /// Drop entries past the retention window.
    pub fn cleanup(&mut self, now: Instant) {
        let retention = self.retention;

        let expired: Vec<Id> = self
            .items
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.stored_at) > retention)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.items.pop(key);
        }

        if !expired.is_empty() {
            trace!(count = expired.len(), "Expired stored values");
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The signable encoding of BEP44: bencode fragments of salt, seq and value.
pub fn encode_signable(seq: i64, value: &[u8], salt: Option<&[u8]>) -> Box<[u8]> {
    let mut signable = vec![];

    if let Some(salt) = salt {
        signable.extend(format!("4:salt{}:", salt.len()).into_bytes());
        signable.extend(salt);
    }

    signable.extend(format!("3:seqi{}e1:v{}:", seq, value.len()).into_bytes());
    signable.extend(value);

    signable.into()
}

/// SHA-1 of the bencoded value, the target of an immutable item.
pub fn hash_immutable(value: &[u8]) -> [u8; ID_SIZE] {
    let mut encoded = Vec::with_capacity(value.len() + 8);
    encoded.extend(format!("{}:", value.len()).bytes());
    encoded.extend_from_slice(value);

    let mut hasher = Sha1::new();
    hasher.update(&encoded);

    hasher.digest().bytes()
}

/// The target of a mutable item: SHA-1 of its public key and optional salt.
pub fn target_from_key(public_key: &[u8; 32], salt: Option<&[u8]>) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(public_key);

    if let Some(salt) = salt {
        hasher.update(salt);
    }

    hasher.digest().bytes().into()
}
