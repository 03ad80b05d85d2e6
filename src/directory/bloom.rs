//! BEP33 scrape Bloom filters.
//!
//! A fixed 2048-bit filter summarizing swarm membership by IP, so a scraping
//! node can estimate swarm size without receiving the peer list.

use std::fmt::{self, Debug, Formatter};
use std::net::IpAddr;

use sha1_smol::Sha1;

/// Filter size in bytes as fixed by BEP33.
pub const FILTER_SIZE: usize = 256;
const M: u32 = (FILTER_SIZE * 8) as u32;
const K: f64 = 2.0;

#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Box<[u8; FILTER_SIZE]>,
}

impl BloomFilter {
    pub fn new() -> BloomFilter {
        BloomFilter {
            bits: Box::new([0; FILTER_SIZE]),
        }
    }

    /// Insert an IP address. Each address sets two bits derived from the
    /// first four bytes of its SHA-1 hash.
    pub fn insert(&mut self, ip: &IpAddr) {
        let mut hasher = Sha1::new();
        match ip {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        }
        let hash = hasher.digest().bytes();

        let index1 = (u16::from_le_bytes([hash[0], hash[1]]) as u32) % M;
        let index2 = (u16::from_le_bytes([hash[2], hash[3]]) as u32) % M;

        self.set(index1);
        self.set(index2);
    }

    /// BEP33's size estimate from the count of zero bits.
    pub fn estimate_size(&self) -> f64 {
        let zeros = self
            .bits
            .iter()
            .map(|byte| byte.count_zeros())
            .sum::<u32>()
            // the formula breaks down for a (nearly) full filter
            .max(1) as f64;

        let m = M as f64;

        (zeros / m).ln() / (K * (1.0 - 1.0 / m).ln())
    }

    pub fn as_bytes(&self) -> &[u8; FILTER_SIZE] {
        &self.bits
    }

    fn set(&mut self, index: u32) {
        self.bits[(index / 8) as usize] |= 0x01 << (index % 8);
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for BloomFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BloomFilter(~{:.1})", self.estimate_size())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_estimates_zero() {
        let filter = BloomFilter::new();
        assert_eq!(filter.estimate_size().round() as u64, 0);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut filter = BloomFilter::new();
        let ip: IpAddr = [93, 184, 216, 34].into();

        filter.insert(&ip);
        let once = *filter.as_bytes();

        filter.insert(&ip);
        assert_eq!(*filter.as_bytes(), once);
    }

    #[test]
    fn estimate_grows_with_distinct_ips() {
        let mut filter = BloomFilter::new();

        for i in 0..100_u8 {
            filter.insert(&[93, 184, i, 1].into());
        }

        let estimate = filter.estimate_size();
        assert!((80.0..120.0).contains(&estimate), "estimate {estimate}");
    }
}
