//! Kademlia node Id or a lookup target

use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The maximum XOR distance between two ids (in bits).
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    /// Full 160-bit XOR metric to a target, usable for ordering candidates.
    pub fn xor(&self, other: &Id) -> [u8; ID_SIZE] {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        result
    }

    /// Generate a random Id at an exact [Id::distance] from `self`.
    ///
    /// Used to target lookups at a specific (under populated) bucket.
    pub fn random_at_distance(&self, distance: u8) -> Id {
        if distance == 0 || distance > MAX_DISTANCE {
            return *self;
        }

        let mut rng = rand::thread_rng();
        let mut bytes = self.0;

        // The first differing bit, counted from the most significant one.
        let pivot = (MAX_DISTANCE - distance) as usize;

        bytes[pivot / 8] ^= 0x80 >> (pivot % 8);

        for bit in (pivot + 1)..(MAX_DISTANCE as usize) {
            if rng.gen::<bool>() {
                bytes[bit / 8] ^= 0x80 >> (bit % 8);
            }
        }

        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.into()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.into()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}
