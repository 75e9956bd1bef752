//! Receive descriptor pool
//!
//! Fixed-capacity arena of receive descriptors. A descriptor is addressed by
//! a [`Cookie`] that packs its arena index, the pool id and a sanity tag.
//! The tag is bumped every time the descriptor is armed, so a completion
//! that refers to an earlier arming is caught on reap.
//!
//! Ownership rules:
//! - a free descriptor sits on the lock-free free list and holds no buffer
//! - an armed descriptor (`in_use`) owns exactly one mapped buffer and is
//!   referenced by one refill ring entry
//! - a reaped descriptor sits on a [`DescList`] until it is re-armed or
//!   returned; dropping a [`DescList`] returns what is left on it

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_queue::ArrayQueue;
use thiserror::Error;
use tracing::{debug, info};

use super::buffer::RxBuffer;

/// Sanity value stored in every live descriptor
pub const RX_DESC_MAGIC: u32 = 0xdec0_de5a;

const INDEX_BITS: u32 = 20;
const POOL_BITS: u32 = 4;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const POOL_MASK: u32 = (1 << POOL_BITS) - 1;

/// Largest pool the cookie index field can address
pub const MAX_POOL_DESCS: usize = 1 << INDEX_BITS;

/// Number of pools the cookie pool field can address
pub const MAX_POOLS: usize = 1 << POOL_BITS;

/// Opaque descriptor handle carried through the rings
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(u32);

impl Cookie {
    pub fn new(index: u32, pool_id: u8, tag: u8) -> Self {
        Self(
            (index & INDEX_MASK)
                | ((u32::from(pool_id) & POOL_MASK) << INDEX_BITS)
                | (u32::from(tag) << (INDEX_BITS + POOL_BITS)),
        )
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    pub fn pool_id(self) -> u8 {
        ((self.0 >> INDEX_BITS) & POOL_MASK) as u8
    }

    pub fn tag(self) -> u8 {
        (self.0 >> (INDEX_BITS + POOL_BITS)) as u8
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.pool_id(), self.index(), self.tag())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({self})")
    }
}

/// Descriptor corruption detected on arm or reap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DescFault {
    #[error("cookie {0} does not address this pool")]
    InvalidCookie(Cookie),

    #[error("descriptor {0} reaped while not in use")]
    NotInUse(Cookie),

    #[error("descriptor {0} failed its sanity check")]
    BadMagic(Cookie),

    #[error("descriptor {0} armed while already in use")]
    AlreadyInUse(Cookie),
}

/// Pool construction errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity must be non-zero")]
    ZeroCapacity,

    #[error("pool capacity {0} exceeds the cookie index space")]
    TooLarge(usize),

    #[error("pool id {0} exceeds the cookie pool field")]
    BadPoolId(u8),
}

struct RxDesc {
    magic: u32,
    generation: u8,
    in_use: bool,
    buf: Option<RxBuffer>,
}

/// State of one descriptor, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescSnapshot {
    pub index: u32,
    pub magic: u32,
    pub generation: u8,
    pub in_use: bool,
    pub has_buffer: bool,
}

/// Fixed-capacity descriptor arena with a lock-free free list
pub struct DescPool {
    pool_id: u8,
    owner: u8,
    slots: Box<[Mutex<RxDesc>]>,
    free: ArrayQueue<u32>,
}

impl DescPool {
    /// Create a pool of `capacity` free descriptors
    pub fn new(pool_id: u8, capacity: usize, owner: u8) -> Result<Arc<Self>, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        if capacity > MAX_POOL_DESCS {
            return Err(PoolError::TooLarge(capacity));
        }
        if usize::from(pool_id) >= MAX_POOLS {
            return Err(PoolError::BadPoolId(pool_id));
        }

        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(RxDesc {
                    magic: RX_DESC_MAGIC,
                    generation: 0,
                    in_use: false,
                    buf: None,
                })
            })
            .collect();

        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            // Cannot fail: the queue was sized for every index
            let _ = free.push(i as u32);
        }

        info!(pool_id, capacity, owner, "Rx descriptor pool created");

        Ok(Arc::new(Self {
            pool_id,
            owner,
            slots,
            free,
        }))
    }

    pub fn pool_id(&self) -> u8 {
        self.pool_id
    }

    /// Return buffer manager id published with every refill entry
    pub fn owner(&self) -> u8 {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Descriptors on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Descriptors currently armed
    pub fn in_use_count(&self) -> usize {
        (0..self.slots.len())
            .filter(|&i| self.slot(i as u32).in_use)
            .count()
    }

    fn slot(&self, index: u32) -> MutexGuard<'_, RxDesc> {
        self.slots[index as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take up to `n` descriptors off the free list
    ///
    /// Never blocks and never hands out more than are free; a short list is
    /// the exhaustion signal.
    pub fn allocate(self: &Arc<Self>, n: usize) -> DescList {
        let mut list = self.empty_list();
        while list.len() < n {
            match self.free.pop() {
                Some(index) => list.indices.push(index),
                None => break,
            }
        }
        if list.len() < n {
            debug!(
                pool_id = self.pool_id,
                requested = n,
                got = list.len(),
                "Rx descriptor pool short"
            );
        }
        list
    }

    /// Empty list bound to this pool
    pub fn empty_list(self: &Arc<Self>) -> DescList {
        DescList {
            pool: Arc::clone(self),
            indices: Vec::new(),
        }
    }

    /// Return a list of descriptors to the free list
    pub fn release(&self, list: DescList) {
        drop(list);
    }

    fn release_index(&self, index: u32) {
        {
            let mut desc = self.slot(index);
            desc.in_use = false;
            desc.buf = None;
        }
        // Cannot overflow: each index is either here or on a list
        let _ = self.free.push(index);
    }

    fn check_cookie(&self, cookie: Cookie) -> Result<(), DescFault> {
        if cookie.pool_id() != self.pool_id || cookie.index() as usize >= self.slots.len() {
            return Err(DescFault::InvalidCookie(cookie));
        }
        Ok(())
    }

    fn check_desc(desc: &RxDesc, cookie: Cookie) -> Result<(), DescFault> {
        if !desc.in_use {
            return Err(DescFault::NotInUse(cookie));
        }
        if desc.magic != RX_DESC_MAGIC || desc.generation != cookie.tag() {
            return Err(DescFault::BadMagic(cookie));
        }
        Ok(())
    }

    /// Attach a mapped buffer to descriptor `index` and mark it in use
    ///
    /// On failure the buffer is handed back to the caller.
    pub fn arm(&self, index: u32, buf: RxBuffer) -> Result<Cookie, (DescFault, RxBuffer)> {
        let cookie = Cookie::new(index, self.pool_id, 0);
        if index as usize >= self.slots.len() {
            return Err((DescFault::InvalidCookie(cookie), buf));
        }

        let mut desc = self.slot(index);
        if desc.in_use {
            return Err((
                DescFault::AlreadyInUse(Cookie::new(index, self.pool_id, desc.generation)),
                buf,
            ));
        }

        desc.generation = desc.generation.wrapping_add(1);
        desc.magic = RX_DESC_MAGIC;
        desc.in_use = true;
        desc.buf = Some(buf);
        Ok(Cookie::new(index, self.pool_id, desc.generation))
    }

    /// Check that `cookie` refers to a live, armed descriptor
    pub fn validate(&self, cookie: Cookie) -> Result<(), DescFault> {
        self.check_cookie(cookie)?;
        let desc = self.slot(cookie.index());
        Self::check_desc(&desc, cookie)
    }

    /// Detach the buffer from a reaped descriptor
    ///
    /// The descriptor leaves the in-use state but is not put back on the
    /// free list; the caller keeps its index on a [`DescList`].
    pub fn take(&self, cookie: Cookie) -> Result<RxBuffer, DescFault> {
        self.check_cookie(cookie)?;
        let mut desc = self.slot(cookie.index());
        Self::check_desc(&desc, cookie)?;
        desc.in_use = false;
        desc.buf.take().ok_or(DescFault::BadMagic(cookie))
    }

    /// Device-side write into the buffer of an armed descriptor
    pub fn dma_write<F>(&self, cookie: Cookie, f: F) -> Result<(), DescFault>
    where
        F: FnOnce(&mut [u8]),
    {
        self.check_cookie(cookie)?;
        let mut desc = self.slot(cookie.index());
        Self::check_desc(&desc, cookie)?;
        match desc.buf.as_mut() {
            Some(buf) => {
                f(buf.backing_mut());
                Ok(())
            }
            None => Err(DescFault::BadMagic(cookie)),
        }
    }

    /// Pull every armed buffer back out of the pool
    ///
    /// Used on detach; afterwards every descriptor is free.
    pub fn reclaim_in_use(&self) -> Vec<RxBuffer> {
        let mut bufs = Vec::new();
        for index in 0..self.slots.len() as u32 {
            let buf = {
                let mut desc = self.slot(index);
                if !desc.in_use {
                    continue;
                }
                desc.in_use = false;
                desc.buf.take()
            };
            bufs.extend(buf);
            let _ = self.free.push(index);
        }
        bufs
    }

    /// Diagnostic snapshot of the descriptor addressed by `cookie`
    pub fn snapshot(&self, cookie: Cookie) -> Option<DescSnapshot> {
        self.check_cookie(cookie).ok()?;
        let desc = self.slot(cookie.index());
        Some(DescSnapshot {
            index: cookie.index(),
            magic: desc.magic,
            generation: desc.generation,
            in_use: desc.in_use,
            has_buffer: desc.buf.is_some(),
        })
    }

    /// Corrupt the sanity value of a descriptor (fault injection)
    #[cfg(test)]
    pub(crate) fn poison(&self, index: u32) {
        self.slot(index).magic = 0;
    }
}

/// Descriptors held outside the free list
///
/// Remaining descriptors go back to the pool when the list is dropped.
pub struct DescList {
    pool: Arc<DescPool>,
    indices: Vec<u32>,
}

impl DescList {
    pub fn pool(&self) -> &Arc<DescPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.indices.pop()
    }

    pub fn push(&mut self, index: u32) {
        self.indices.push(index);
    }
}

impl Drop for DescList {
    fn drop(&mut self) {
        for index in self.indices.drain(..) {
            self.pool.release_index(index);
        }
    }
}

impl fmt::Debug for DescList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescList")
            .field("pool_id", &self.pool.pool_id)
            .field("len", &self.indices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> RxBuffer {
        RxBuffer::new(64, 0, 4)
    }

    #[test]
    fn test_cookie_fields() {
        let c = Cookie::new(12345, 3, 200);
        assert_eq!(c.index(), 12345);
        assert_eq!(c.pool_id(), 3);
        assert_eq!(c.tag(), 200);
        assert_eq!(Cookie::from_raw(c.raw()), c);
        assert_eq!(c.to_string(), "3:12345#200");
    }

    #[test]
    fn test_pool_geometry_errors() {
        assert!(matches!(DescPool::new(0, 0, 0), Err(PoolError::ZeroCapacity)));
        assert!(matches!(
            DescPool::new(0, MAX_POOL_DESCS + 1, 0),
            Err(PoolError::TooLarge(_))
        ));
        assert!(matches!(
            DescPool::new(MAX_POOLS as u8, 4, 0),
            Err(PoolError::BadPoolId(_))
        ));
    }

    #[test]
    fn test_allocate_partial_on_exhaustion() {
        let pool = DescPool::new(0, 4, 0).unwrap();
        let a = pool.allocate(3);
        assert_eq!(a.len(), 3);
        let b = pool.allocate(3);
        assert_eq!(b.len(), 1);
        assert_eq!(pool.free_count(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_arm_take_cycle() {
        let pool = DescPool::new(1, 4, 0).unwrap();
        let mut list = pool.allocate(1);
        let index = list.pop().unwrap();

        let cookie = pool.arm(index, buf()).unwrap();
        assert_eq!(cookie.pool_id(), 1);
        assert_eq!(pool.in_use_count(), 1);
        assert!(pool.validate(cookie).is_ok());

        let taken = pool.take(cookie).unwrap();
        assert_eq!(taken.len(), 64);
        assert_eq!(pool.in_use_count(), 0);

        // Second reap of the same completion
        assert_eq!(pool.take(cookie).unwrap_err(), DescFault::NotInUse(cookie));

        list.push(index);
        drop(list);
        assert_eq!(pool.free_count() + pool.in_use_count(), pool.capacity());
    }

    #[test]
    fn test_stale_cookie_after_rearm() {
        let pool = DescPool::new(0, 2, 0).unwrap();
        let mut list = pool.allocate(1);
        let index = list.pop().unwrap();

        let first = pool.arm(index, buf()).unwrap();
        pool.take(first).unwrap();
        let second = pool.arm(index, buf()).unwrap();

        assert_ne!(first, second);
        assert_eq!(pool.validate(first), Err(DescFault::BadMagic(first)));
        assert!(pool.validate(second).is_ok());
        pool.take(second).unwrap();
        list.push(index);
    }

    #[test]
    fn test_arm_in_use_returns_buffer() {
        let pool = DescPool::new(0, 2, 0).unwrap();
        let mut list = pool.allocate(1);
        let index = list.pop().unwrap();
        let cookie = pool.arm(index, buf()).unwrap();

        let (fault, returned) = pool.arm(index, buf()).unwrap_err();
        assert!(matches!(fault, DescFault::AlreadyInUse(_)));
        assert_eq!(returned.len(), 64);

        pool.take(cookie).unwrap();
        list.push(index);
    }

    #[test]
    fn test_poisoned_magic_detected() {
        let pool = DescPool::new(0, 2, 0).unwrap();
        let mut list = pool.allocate(1);
        let index = list.pop().unwrap();
        let cookie = pool.arm(index, buf()).unwrap();

        pool.poison(index);
        assert_eq!(pool.validate(cookie), Err(DescFault::BadMagic(cookie)));
        assert_eq!(pool.snapshot(cookie).unwrap().magic, 0);
    }

    #[test]
    fn test_foreign_cookie_rejected() {
        let pool = DescPool::new(0, 2, 0).unwrap();
        let other = Cookie::new(0, 1, 1);
        assert_eq!(pool.validate(other), Err(DescFault::InvalidCookie(other)));
        let out_of_range = Cookie::new(9, 0, 1);
        assert!(matches!(
            pool.validate(out_of_range),
            Err(DescFault::InvalidCookie(_))
        ));
    }

    #[test]
    fn test_reclaim_in_use_and_dma_write() {
        let pool = DescPool::new(0, 3, 0).unwrap();
        let mut list = pool.allocate(2);
        let c0 = pool.arm(list.pop().unwrap(), buf()).unwrap();
        let _c1 = pool.arm(list.pop().unwrap(), buf()).unwrap();

        pool.dma_write(c0, |mem| mem[0] = 0x5a).unwrap();

        let bufs = pool.reclaim_in_use();
        assert_eq!(bufs.len(), 2);
        assert!(bufs.iter().any(|b| b.data()[0] == 0x5a));
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.free_count(), 3);
    }
}
