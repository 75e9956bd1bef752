//! Receive buffers and packet lists
//!
//! An [`RxBuffer`] is one device-visible receive buffer. It keeps a
//! `start`/`len` window over its backing memory so headers can be pulled
//! without copying, a control block ([`RxCb`]) with the per-buffer metadata
//! stashed by the ring servicer, and an extension chain for payloads that
//! span several buffers.
//!
//! A [`PacketList`] is the owned batch type used between the servicer, the
//! classifier and the delivery callback. Moving a buffer into a list moves
//! ownership, so a buffer can never sit on two lists.

use std::collections::VecDeque;
use std::time::Instant;

use super::dma::DmaAddr;

/// Checksum verdict attached by the checksum-offload step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumHint {
    #[default]
    None,
    /// Device verified IP and L4 checksums
    Unnecessary,
}

/// Mesh receive information attached to mesh-mode frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshRxInfo {
    pub first_msdu: bool,
    pub last_msdu: bool,
    pub decrypted: bool,
    pub key_index: u8,
    pub rssi: u8,
    pub channel: u16,
    pub rate_phy: u32,
}

/// Receive offload hints for TCP frames, consumed by GRO/LRO in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroInfo {
    pub lro_eligible: bool,
    pub tcp_pure_ack: bool,
    pub ipv6: bool,
    pub l4_offset: u16,
    pub flow_id: u32,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_win: u16,
    pub tcp_chksum: u16,
}

/// Per-buffer control block
///
/// Filled during the reap pass so the second pass does not have to go back
/// to the ring entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxCb {
    pub peer_id: u16,
    pub msdu_len: u16,
    pub tid: u8,
    pub ring_id: u8,
    pub pool_id: u8,
    pub chfrag_start: bool,
    pub chfrag_cont: bool,
    /// First buffer of an MSDU; the previous buffer had no continuation
    pub msdu_start: bool,
    pub chfrag_end: bool,
    pub da_mcbc: bool,
    pub da_valid: bool,
    pub sa_valid: bool,
    /// Part of a raw (undecapsulated) aggregate
    pub raw_frame: bool,
    /// Re-injected 802.11 fragment
    pub frag: bool,
    /// Last buffer reaped in a service call
    pub flush_ind: bool,
    pub cksum: ChecksumHint,
    pub protocol_tag: u16,
    pub mesh: Option<MeshRxInfo>,
    pub gro: Option<GroInfo>,
    pub timestamp: Option<Instant>,
}

/// Owned receive buffer
pub struct RxBuffer {
    data: Box<[u8]>,
    start: usize,
    len: usize,
    dma: Option<DmaAddr>,
    /// Control block
    pub cb: RxCb,
    ext: Vec<RxBuffer>,
    ext_len: usize,
}

impl RxBuffer {
    /// Allocate a zeroed buffer of `size` usable bytes
    ///
    /// `reserve` bytes of headroom are kept in front of the data start, and
    /// the data start is aligned to `align` bytes.
    pub fn new(size: usize, reserve: usize, align: usize) -> Self {
        let align = align.max(1);
        let data = vec![0u8; size + reserve + align].into_boxed_slice();
        let misalign = (data.as_ptr() as usize + reserve) % align;
        let start = reserve + if misalign == 0 { 0 } else { align - misalign };

        Self {
            data,
            start,
            len: size,
            dma: None,
            cb: RxCb::default(),
            ext: Vec::new(),
            ext_len: 0,
        }
    }

    /// Build a linear buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len(), 0, 1);
        buf.data_mut().copy_from_slice(bytes);
        buf
    }

    /// Get the valid data slice of the head buffer
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    /// Get the valid data slice of the head buffer mutably
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    /// Bytes in the head buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.ext_len == 0
    }

    /// Bytes in the head buffer plus the extension chain
    #[inline]
    pub fn total_len(&self) -> usize {
        self.len + self.ext_len
    }

    /// Bytes available from the data start to the end of the backing memory
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.start
    }

    /// Set the head length measured from the current data start
    ///
    /// Panics if `len` exceeds the backing memory; callers bound it first.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.tailroom(), "set_len beyond buffer end");
        self.len = len;
    }

    /// Strip `n` leading bytes from the head buffer
    ///
    /// Panics if fewer than `n` bytes are present.
    pub fn pull_head(&mut self, n: usize) {
        assert!(self.len >= n, "pull_head beyond data");
        self.start += n;
        self.len -= n;
    }

    /// Device address while mapped
    pub fn dma_addr(&self) -> Option<DmaAddr> {
        self.dma
    }

    pub(crate) fn set_dma_addr(&mut self, addr: Option<DmaAddr>) {
        self.dma = addr;
    }

    /// Address of the first data byte, used as the identity mapping
    pub(crate) fn data_ptr_addr(&self) -> u64 {
        self.data[self.start..].as_ptr() as u64
    }

    /// Whether the payload spans an extension chain
    pub fn is_nonlinear(&self) -> bool {
        !self.ext.is_empty()
    }

    /// Append `buf` to the extension chain
    pub fn push_ext(&mut self, buf: RxBuffer) {
        self.ext_len += buf.total_len();
        self.ext.push(buf);
    }

    /// Buffers on the extension chain
    pub fn ext(&self) -> &[RxBuffer] {
        &self.ext
    }

    /// Bytes held by the extension chain
    pub fn ext_len(&self) -> usize {
        self.ext_len
    }

    /// Copy the head and the extension chain into one contiguous vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        self.copy_into(&mut out);
        out
    }

    fn copy_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.data());
        for ext in &self.ext {
            ext.copy_into(out);
        }
    }

    /// Merge the extension chain into a single contiguous buffer
    ///
    /// Fails without touching the buffer if the merged buffer cannot be
    /// allocated.
    pub fn linearize(&mut self) -> Result<(), std::collections::TryReserveError> {
        if self.ext.is_empty() {
            return Ok(());
        }

        let mut merged = Vec::new();
        merged.try_reserve_exact(self.total_len())?;
        self.copy_into(&mut merged);

        self.len = merged.len();
        self.data = merged.into_boxed_slice();
        self.start = 0;
        self.ext.clear();
        self.ext_len = 0;
        Ok(())
    }

    /// Deep copy of the payload with a cleared control block
    ///
    /// Returns `None` if the copy cannot be allocated.
    pub fn try_copy(&self) -> Option<RxBuffer> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(self.total_len()).ok()?;
        self.copy_into(&mut bytes);
        let len = bytes.len();
        Some(Self {
            data: bytes.into_boxed_slice(),
            start: 0,
            len,
            dma: None,
            cb: RxCb::default(),
            ext: Vec::new(),
            ext_len: 0,
        })
    }

    /// Raw backing memory, used for device-side writes
    pub(crate) fn backing_mut(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.data[start..]
    }
}

impl std::fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxBuffer")
            .field("len", &self.len)
            .field("ext_len", &self.ext_len)
            .field("ext", &self.ext.len())
            .field("dma", &self.dma)
            .field("cb", &self.cb)
            .finish()
    }
}

/// Ordered, owned list of buffers
#[derive(Debug, Default)]
pub struct PacketList {
    inner: VecDeque<RxBuffer>,
}

impl PacketList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push_back(&mut self, buf: RxBuffer) {
        self.inner.push_back(buf);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<RxBuffer> {
        self.inner.pop_front()
    }

    /// Put a buffer back at the head of the list
    pub fn push_front(&mut self, buf: RxBuffer) {
        self.inner.push_front(buf);
    }

    pub fn front(&self) -> Option<&RxBuffer> {
        self.inner.front()
    }

    pub fn back_mut(&mut self) -> Option<&mut RxBuffer> {
        self.inner.back_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RxBuffer> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RxBuffer> {
        self.inner.iter_mut()
    }

    /// Move the whole list out, leaving this one empty
    pub fn take(&mut self) -> PacketList {
        std::mem::take(self)
    }
}

impl IntoIterator for PacketList {
    type Item = RxBuffer;
    type IntoIter = std::collections::vec_deque::IntoIter<RxBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl FromIterator<RxBuffer> for PacketList {
    fn from_iter<I: IntoIterator<Item = RxBuffer>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
