//! Anti-spoof tokens bound to (requester id, ip, port, target key).

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::Instant;

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;
use tracing::trace;

use crate::common::{Id, TOKEN_ROTATE_INTERVAL};

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Tokens generator.
///
/// A token is a checksum over the requester tuple and a rotating secret, so
/// it is only valid for the exact (id, ip, port, key) it was issued for, and
/// only for as long as the issuing secret or its successor is current.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    pub fn new() -> Self {
        Tokens {
            prev_secret: random_secret(),
            curr_secret: random_secret(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was issued for this exact tuple within the
    /// last two secret rotations.
    pub fn validate(&self, token: &[u8], id: &Id, from: SocketAddr, key: &Id) -> bool {
        let curr = self.checksum(id, from, key, &self.curr_secret);
        let prev = self.checksum(id, from, key, &self.prev_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating token secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = random_secret();

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote peer and a target key.
    pub fn generate(&self, id: &Id, from: SocketAddr, key: &Id) -> [u8; TOKEN_SIZE] {
        self.checksum(id, from, key, &self.curr_secret)
    }

    // === Private Methods ===

    fn checksum(
        &self,
        id: &Id,
        from: SocketAddr,
        key: &Id,
        secret: &[u8; SECRET_SIZE],
    ) -> [u8; TOKEN_SIZE] {
        let mut digest = CASTAGNOLI.digest();

        digest.update(id.as_bytes());
        match from.ip() {
            std::net::IpAddr::V4(ip) => digest.update(&ip.octets()),
            std::net::IpAddr::V6(ip) => digest.update(&ip.octets()),
        }
        digest.update(&from.port().to_be_bytes());
        digest.update(key.as_bytes());
        digest.update(secret);

        digest.finalize().to_be_bytes()
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; SECRET_SIZE] {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup() -> (Tokens, Id, SocketAddr, Id) {
        (
            Tokens::new(),
            Id::random(),
            SocketAddr::from(([93, 184, 216, 34], 6881)),
            Id::random(),
        )
    }

    #[test]
    fn roundtrip() {
        let (tokens, id, from, key) = setup();

        let token = tokens.generate(&id, from, &key);
        assert!(tokens.validate(&token, &id, from, &key));
    }

    #[test]
    fn bound_to_tuple() {
        let (tokens, id, from, key) = setup();
        let token = tokens.generate(&id, from, &key);

        let other_ip = SocketAddr::from(([93, 184, 216, 35], 6881));
        let other_port = SocketAddr::from(([93, 184, 216, 34], 6882));

        assert!(!tokens.validate(&token, &Id::random(), from, &key));
        assert!(!tokens.validate(&token, &id, other_ip, &key));
        assert!(!tokens.validate(&token, &id, other_port, &key));
        assert!(!tokens.validate(&token, &id, from, &Id::random()));
    }

    #[test]
    fn survives_one_rotation_not_two() {
        let (mut tokens, id, from, key) = setup();
        let token = tokens.generate(&id, from, &key);

        tokens.rotate();
        assert!(tokens.validate(&token, &id, from, &key));

        tokens.rotate();
        assert!(!tokens.validate(&token, &id, from, &key));
    }
}
