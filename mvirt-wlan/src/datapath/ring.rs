//! Ring access contract
//!
//! Two ring shapes are used by the receive path:
//! - [`DestRing`]: completion (REO destination) ring, produced by the device
//!   and consumed by one [`RingServicer`](super::servicer::RingServicer)
//! - [`RefillRing`]: buffer refill ring, produced by the replenisher and
//!   consumed by the device
//!
//! Software and device advance independent cursors. Between
//! `access_start` and `access_end` the software side works on a cached copy
//! of the device cursor and publishes its own cursor only at `access_end`.
//!
//! [`soft_dest_ring`] and [`soft_refill_ring`] build in-memory rings whose
//! device side is driven by the emulator or by tests.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::desc_pool::Cookie;
use super::dma::DmaAddr;

/// Ring access errors
#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring access failed")]
    AccessFailed,

    #[error("ring full")]
    Full,

    #[error("ring state lock poisoned")]
    Poisoned,
}

/// Entry published on the refill ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillEntry {
    pub paddr: DmaAddr,
    pub cookie: Cookie,
    /// Return buffer manager that owns the buffer
    pub owner: u8,
}

/// Aggregate (MPDU) information of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpduDescInfo {
    /// Raw (undecapsulated) aggregate that may span entries
    pub raw_ampdu: bool,
    /// Re-injected 802.11 fragment
    pub fragment: bool,
    pub peer_meta_data: u32,
}

impl MpduDescInfo {
    /// Peer id carried in the low half of the peer metadata
    pub fn peer_id(&self) -> u16 {
        (self.peer_meta_data & 0xffff) as u16
    }
}

/// Sub-unit (MSDU) information of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsduDescInfo {
    pub first_msdu: bool,
    /// More buffers of this MSDU follow
    pub continuation: bool,
    pub last_msdu: bool,
    pub da_is_mcbc: bool,
    pub da_is_valid: bool,
    pub sa_is_valid: bool,
    pub msdu_len: u16,
}

/// Completion status reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReoStatus {
    #[default]
    Ok,
    /// The ring itself is in an unrecoverable state
    ErrorDetected,
}

/// Entry on a completion ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxCompletion {
    pub status: ReoStatus,
    pub cookie: Cookie,
    pub mpdu: MpduDescInfo,
    pub msdu: MsduDescInfo,
    /// REO queue number, which is the TID
    pub queue: u8,
}

/// Consumer side of a completion ring
pub trait DestRing: Send {
    fn ring_id(&self) -> u8;

    /// Enter the critical section and snapshot the device cursor
    fn access_start(&mut self) -> Result<(), RingError>;

    /// Publish consumed entries and leave the critical section
    fn access_end(&mut self);

    /// Next completed entry without consuming it
    fn peek(&mut self) -> Option<RxCompletion>;

    /// Consume the next completed entry
    fn pop(&mut self) -> Option<RxCompletion>;

    /// Completed entries not yet consumed
    fn num_valid(&mut self, sync_hw: bool) -> usize;
}

/// Producer side of a refill ring
pub trait RefillRing: Send {
    /// Ring size in entries
    fn num_entries(&self) -> usize;

    /// Enter the critical section and snapshot the device cursor
    fn access_start(&mut self) -> Result<(), RingError>;

    /// Publish produced entries and leave the critical section
    fn access_end(&mut self);

    /// Free slots the software may fill
    fn num_avail(&mut self, sync_hw: bool) -> usize;

    /// Fill the next free slot
    fn push(&mut self, entry: RefillEntry) -> Result<(), RingError>;
}

/// Shared ring memory with the device-visible cursors
struct RingCore<T> {
    slots: Box<[Option<T>]>,
    /// Producer cursor
    hp: usize,
    /// Consumer cursor
    tp: usize,
}

type SharedCore<T> = Arc<Mutex<RingCore<T>>>;

fn new_core<T: Copy>(entries: usize) -> SharedCore<T> {
    Arc::new(Mutex::new(RingCore {
        slots: vec![None; entries].into_boxed_slice(),
        hp: 0,
        tp: 0,
    }))
}

/// Software completion ring, consumer side
pub struct SoftDestRing {
    id: u8,
    size: usize,
    core: SharedCore<RxCompletion>,
    tp: usize,
    cached_hp: usize,
}

/// Software completion ring, device side
#[derive(Clone)]
pub struct DestRingProducer {
    size: usize,
    core: SharedCore<RxCompletion>,
}

/// Build a completion ring with `entries` slots (one is kept empty)
pub fn soft_dest_ring(id: u8, entries: usize) -> (SoftDestRing, DestRingProducer) {
    let entries = entries.max(2);
    let core = new_core(entries);
    (
        SoftDestRing {
            id,
            size: entries,
            core: Arc::clone(&core),
            tp: 0,
            cached_hp: 0,
        },
        DestRingProducer {
            size: entries,
            core,
        },
    )
}

impl DestRing for SoftDestRing {
    fn ring_id(&self) -> u8 {
        self.id
    }

    fn access_start(&mut self) -> Result<(), RingError> {
        let core = self.core.lock().map_err(|_| RingError::Poisoned)?;
        self.tp = core.tp;
        self.cached_hp = core.hp;
        Ok(())
    }

    fn access_end(&mut self) {
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        core.tp = self.tp;
    }

    fn peek(&mut self) -> Option<RxCompletion> {
        if self.tp == self.cached_hp {
            return None;
        }
        let core = self.core.lock().ok()?;
        core.slots[self.tp]
    }

    fn pop(&mut self) -> Option<RxCompletion> {
        let entry = self.peek()?;
        self.tp = (self.tp + 1) % self.size;
        Some(entry)
    }

    fn num_valid(&mut self, sync_hw: bool) -> usize {
        if sync_hw && let Ok(core) = self.core.lock() {
            self.cached_hp = core.hp;
        }
        (self.cached_hp + self.size - self.tp) % self.size
    }
}

impl DestRingProducer {
    /// Post a completion; fails when the software side has not caught up
    pub fn post(&self, entry: RxCompletion) -> Result<(), RingError> {
        let mut core = self.core.lock().map_err(|_| RingError::Poisoned)?;
        let next = (core.hp + 1) % self.size;
        if next == core.tp {
            return Err(RingError::Full);
        }
        let hp = core.hp;
        core.slots[hp] = Some(entry);
        core.hp = next;
        Ok(())
    }

    /// Completions posted but not yet consumed by software
    pub fn pending(&self) -> usize {
        match self.core.lock() {
            Ok(core) => (core.hp + self.size - core.tp) % self.size,
            Err(_) => 0,
        }
    }

    /// Free completion slots
    pub fn space(&self) -> usize {
        self.size - 1 - self.pending()
    }
}

/// Software refill ring, producer side
pub struct SoftRefillRing {
    size: usize,
    core: SharedCore<RefillEntry>,
    hp: usize,
    cached_tp: usize,
}

/// Software refill ring, device side
#[derive(Clone)]
pub struct RefillRingConsumer {
    size: usize,
    core: SharedCore<RefillEntry>,
}

/// Build a refill ring with `entries` slots (one is kept empty)
pub fn soft_refill_ring(entries: usize) -> (SoftRefillRing, RefillRingConsumer) {
    let entries = entries.max(2);
    let core = new_core(entries);
    (
        SoftRefillRing {
            size: entries,
            core: Arc::clone(&core),
            hp: 0,
            cached_tp: 0,
        },
        RefillRingConsumer {
            size: entries,
            core,
        },
    )
}

impl RefillRing for SoftRefillRing {
    fn num_entries(&self) -> usize {
        self.size
    }

    fn access_start(&mut self) -> Result<(), RingError> {
        let core = self.core.lock().map_err(|_| RingError::Poisoned)?;
        self.hp = core.hp;
        self.cached_tp = core.tp;
        Ok(())
    }

    fn access_end(&mut self) {
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        core.hp = self.hp;
    }

    fn num_avail(&mut self, sync_hw: bool) -> usize {
        if sync_hw && let Ok(core) = self.core.lock() {
            self.cached_tp = core.tp;
        }
        (self.cached_tp + self.size - self.hp - 1) % self.size
    }

    fn push(&mut self, entry: RefillEntry) -> Result<(), RingError> {
        if self.num_avail(false) == 0 {
            return Err(RingError::Full);
        }
        let mut core = self.core.lock().map_err(|_| RingError::Poisoned)?;
        core.slots[self.hp] = Some(entry);
        self.hp = (self.hp + 1) % self.size;
        Ok(())
    }
}

impl RefillRingConsumer {
    /// Take the next published buffer, as the device would
    pub fn take(&self) -> Option<RefillEntry> {
        let mut core = self.core.lock().ok()?;
        if core.tp == core.hp {
            return None;
        }
        let tp = core.tp;
        let entry = core.slots[tp].take();
        core.tp = (tp + 1) % self.size;
        entry
    }

    /// Published buffers the device has not taken yet
    pub fn posted(&self) -> usize {
        match self.core.lock() {
            Ok(core) => (core.hp + self.size - core.tp) % self.size,
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(index: u32) -> RxCompletion {
        RxCompletion {
            status: ReoStatus::Ok,
            cookie: Cookie::new(index, 0, 0),
            mpdu: MpduDescInfo::default(),
            msdu: MsduDescInfo::default(),
            queue: 0,
        }
    }

    #[test]
    fn test_dest_ring_consume_is_published_at_access_end() {
        let (mut ring, hw) = soft_dest_ring(0, 8);
        hw.post(completion(1)).unwrap();
        hw.post(completion(2)).unwrap();

        ring.access_start().unwrap();
        assert_eq!(ring.num_valid(false), 2);
        assert_eq!(ring.peek().unwrap().cookie.index(), 1);
        assert_eq!(ring.pop().unwrap().cookie.index(), 1);
        assert_eq!(ring.num_valid(false), 1);

        // Not yet published to the device side
        assert_eq!(hw.pending(), 2);
        ring.access_end();
        assert_eq!(hw.pending(), 1);
    }

    #[test]
    fn test_dest_ring_snapshot_until_sync() {
        let (mut ring, hw) = soft_dest_ring(0, 8);
        ring.access_start().unwrap();
        hw.post(completion(1)).unwrap();

        assert!(ring.peek().is_none());
        assert_eq!(ring.num_valid(true), 1);
        assert!(ring.peek().is_some());
        ring.access_end();
    }

    #[test]
    fn test_dest_ring_full() {
        let (_ring, hw) = soft_dest_ring(0, 4);
        for i in 0..3 {
            hw.post(completion(i)).unwrap();
        }
        assert!(matches!(hw.post(completion(3)), Err(RingError::Full)));
        assert_eq!(hw.space(), 0);
    }

    #[test]
    fn test_refill_ring_avail_and_wrap() {
        let (mut ring, hw) = soft_refill_ring(4);
        let entry = RefillEntry {
            paddr: 0x1000,
            cookie: Cookie::new(0, 0, 0),
            owner: 3,
        };

        ring.access_start().unwrap();
        assert_eq!(ring.num_avail(true), 3);
        for _ in 0..3 {
            ring.push(entry).unwrap();
        }
        assert!(matches!(ring.push(entry), Err(RingError::Full)));
        ring.access_end();

        assert_eq!(hw.posted(), 3);
        assert_eq!(hw.take(), Some(entry));
        assert_eq!(hw.posted(), 2);

        ring.access_start().unwrap();
        assert_eq!(ring.num_avail(true), 1);
        ring.push(entry).unwrap();
        ring.access_end();
        assert_eq!(hw.posted(), 3);
    }
}
