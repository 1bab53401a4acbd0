use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::host::{HostId, RecordKey};

/// Cookies are drawn from `0..COOKIE_SPACE`
const COOKIE_SPACE: u32 = 1_000_000;

/// Registry of live alert cookies and the record each one belongs to
#[derive(Debug)]
pub struct CookieJar {
    live: HashMap<u32, (HostId, RecordKey)>,
    rng: StdRng,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            live: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw a fresh cookie that no live record currently holds.
    pub fn issue(&mut self, host: HostId, key: RecordKey) -> u32 {
        loop {
            let value = self.rng.gen_range(0..COOKIE_SPACE);
            if !self.live.contains_key(&value) {
                self.live.insert(value, (host, key));
                return value;
            }
        }
    }

    /// Re-register a cookie loaded from a checkpoint. Fails on collision.
    pub fn restore(&mut self, value: u32, host: HostId, key: RecordKey) -> bool {
        if self.live.contains_key(&value) {
            return false;
        }
        self.live.insert(value, (host, key));
        true
    }

    pub fn lookup(&self, value: u32) -> Option<&(HostId, RecordKey)> {
        self.live.get(&value)
    }

    pub fn revoke(&mut self, value: u32) {
        self.live.remove(&value);
    }

    pub fn revoke_host(&mut self, host: HostId) {
        self.live.retain(|_, (owner, _)| *owner != host);
    }

    /// Point a cookie at a record that moved to a new key.
    pub fn rekey(&mut self, value: u32, key: RecordKey) {
        if let Some(entry) = self.live.get_mut(&value) {
            entry.1 = key;
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
