//! Codec instance pool
//!
//! Packer/Unpacker instances carry scratch buffers that are worth
//! reusing. The pool is a bounded, explicitly-owned object injected
//! into the session layer; correctness never depends on it being
//! present. `acquire_*` falls back to a fresh allocation when the pool
//! is empty or disabled, `release_*` drops the instance when the pool
//! is full or disabled.

use parking_lot::Mutex;

use super::{Packer, Unpacker};

/// Bounded pool of reusable codec instances.
pub struct CodecPool {
    packers: Mutex<Vec<Packer>>,
    unpackers: Mutex<Vec<Unpacker>>,
    capacity: usize,
}

impl CodecPool {
    /// Pool holding up to `capacity` packers and `capacity` unpackers.
    pub fn new(capacity: usize) -> Self {
        Self {
            packers: Mutex::new(Vec::with_capacity(capacity)),
            unpackers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// A pool that never retains instances; every acquire allocates.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn acquire_packer(&self) -> Packer {
        self.packers.lock().pop().unwrap_or_default()
    }

    pub fn release_packer(&self, mut packer: Packer) {
        packer.clear();
        let mut packers = self.packers.lock();
        if packers.len() < self.capacity {
            packers.push(packer);
        }
    }

    pub fn acquire_unpacker(&self) -> Unpacker {
        self.unpackers.lock().pop().unwrap_or_default()
    }

    pub fn release_unpacker(&self, unpacker: Unpacker) {
        let mut unpackers = self.unpackers.lock();
        if unpackers.len() < self.capacity {
            unpackers.push(unpacker);
        }
    }
}
