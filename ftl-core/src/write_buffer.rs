//! Per-channel write buffer (§3 "Write-buffer entry", §3 "Batch", §4.6).
//!
//! Grounded on `ftl_rwb.c`'s free/submit ring pair per channel and its
//! `ftl_rwb_pop` batching algorithm, which rotates which channel is
//! drained first on every pop so no channel can starve another (§5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::address::{Addr, LBA_INVALID};
use crate::l2p::L2pTable;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Internal (relocator/pad) writes bypass the qdepth back-pressure
        /// check in `acquire`.
        const INTERNAL = 1 << 0;
        /// A "weak" write: only commit the L2P update if the address the
        /// writer believed it held is still current (§4.5, §4.10).
        const WEAK = 1 << 1;
    }
}

#[derive(Debug)]
pub struct EntryInner {
    pub payload: Vec<u8>,
    pub lba: u64,
    /// The base-device address this entry's data was persisted at, once
    /// the write pointer's batch completes. `Addr::Invalid` until then.
    pub persisted_addr: Addr,
    pub source_band: Option<u64>,
    pub flags: EntryFlags,
}

pub struct WriteBufferEntry {
    pub channel: u16,
    pub index: u32,
    pub inner: mutex::SpinLock<EntryInner>,
    /// Set only while `L2P[lba] == self.addr()` (invariant 7). Readers
    /// consult this before trusting the buffer contents.
    pub valid: AtomicBool,
}

impl WriteBufferEntry {
    pub fn addr(&self) -> Addr {
        Addr::Cached { channel: self.channel, index: self.index }
    }
}

pub struct WriteBufferChannel {
    pub entries: Vec<Arc<WriteBufferEntry>>,
    free: mutex::SpinLock<VecDeque<u32>>,
    submit: mutex::SpinLock<VecDeque<u32>>,
    pub outstanding: AtomicUsize,
    pub qdepth_limit: AtomicUsize,
}

impl WriteBufferChannel {
    pub fn new(channel: u16, num_entries: u32, block_size: usize) -> Self {
        let entries = (0..num_entries)
            .map(|index| {
                Arc::new(WriteBufferEntry {
                    channel,
                    index,
                    inner: mutex::SpinLock::new(EntryInner {
                        payload: vec![0u8; block_size],
                        lba: LBA_INVALID,
                        persisted_addr: Addr::Invalid,
                        source_band: None,
                        flags: EntryFlags::empty(),
                    }),
                    valid: AtomicBool::new(false),
                })
            })
            .collect::<Vec<_>>();
        let free = (0..num_entries).collect::<VecDeque<_>>();
        WriteBufferChannel {
            entries,
            free: mutex::SpinLock::new(free),
            submit: mutex::SpinLock::new(VecDeque::new()),
            outstanding: AtomicUsize::new(0),
            qdepth_limit: AtomicUsize::new(num_entries as usize),
        }
    }

    /// `acquire(flags) -> entry | None` (§4.6): rejects non-internal
    /// requests once `outstanding` exceeds the back-pressure qdepth limit.
    pub fn acquire(&self, l2p: &L2pTable, flags: EntryFlags) -> Option<Arc<WriteBufferEntry>> {
        let internal = flags.contains(EntryFlags::INTERNAL);
        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        if !internal && outstanding > self.qdepth_limit.load(Ordering::Relaxed) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        let idx = match self.free.lock().pop_front() {
            Some(idx) => idx,
            None => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        };
        let entry = self.entries[idx as usize].clone();
        self.evict(&entry, l2p);
        entry.inner.lock().flags = flags;
        Some(entry)
    }

    /// `fill(io)` (§4.6): copies payload and records the LBA (and, for
    /// relocator-sourced writes, the source band) before the caller installs
    /// the entry's cache-address into the L2P and pushes it to the submit
    /// ring.
    pub fn fill(&self, entry: &WriteBufferEntry, lba: u64, data: &[u8], source_band: Option<u64>) {
        let mut inner = entry.inner.lock();
        inner.payload.copy_from_slice(data);
        inner.lba = lba;
        inner.source_band = source_band;
    }

    pub fn push_submit(&self, index: u32) {
        self.submit.lock().push_back(index);
    }

    fn pop_submit(&self) -> Option<u32> {
        self.submit.lock().pop_front()
    }

    pub fn release(&self, index: u32) {
        self.free.lock().push_back(index);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Eviction (§4.6): clears `valid` under the entry's lock and, if the
    /// L2P still points at this entry, advances it to the entry's
    /// persisted address before the slot is handed out again. Otherwise a
    /// newer write already replaced the mapping and nothing is done.
    fn evict(&self, entry: &WriteBufferEntry, l2p: &L2pTable) {
        let mut inner = entry.inner.lock();
        entry.valid.store(false, Ordering::Release);
        if !l2p.is_empty() && inner.lba != LBA_INVALID && l2p.get(inner.lba) == entry.addr() {
            l2p.set(inner.lba, inner.persisted_addr);
        }
        inner.lba = LBA_INVALID;
        inner.persisted_addr = Addr::Invalid;
        inner.source_band = None;
    }
}

/// `xfer_size` entries grouped for a single device write (§3 "Batch").
pub struct Batch {
    pub entries: Vec<(u16, u32)>,
}

pub struct WriteBuffer {
    pub channels: Vec<WriteBufferChannel>,
    retry_queue: mutex::SpinLock<VecDeque<Batch>>,
    next_channel: AtomicUsize,
    xfer_size: usize,
}

impl WriteBuffer {
    pub fn new(num_channels: u16, entries_per_channel: u32, block_size: usize, xfer_size: usize) -> Self {
        let channels = (0..num_channels)
            .map(|c| WriteBufferChannel::new(c, entries_per_channel, block_size))
            .collect();
        WriteBuffer {
            channels,
            retry_queue: mutex::SpinLock::new(VecDeque::new()),
            next_channel: AtomicUsize::new(0),
            xfer_size,
        }
    }

    pub fn retry(&self, batch: Batch) {
        self.retry_queue.lock().push_back(batch);
    }

    /// `ftl_rwb_pop`: retry entries drain first; otherwise round-robins
    /// across channels, rotating the starting channel on each call.
    pub fn pop_batch(&self) -> Option<Batch> {
        if let Some(batch) = self.retry_queue.lock().pop_front() {
            return Some(batch);
        }
        let n = self.channels.len();
        if n == 0 {
            return None;
        }
        let start = self.next_channel.fetch_add(1, Ordering::Relaxed) % n;
        let mut entries = Vec::new();
        let mut empty_streak = 0;
        let mut ch = start;
        while entries.len() < self.xfer_size && empty_streak < n {
            match self.channels[ch].pop_submit() {
                Some(idx) => {
                    entries.push((ch as u16, idx));
                    empty_streak = 0;
                }
                None => empty_streak += 1,
            }
            ch = (ch + 1) % n;
        }
        if entries.is_empty() {
            None
        } else {
            Some(Batch { entries })
        }
    }

    pub fn release_batch(&self, batch: &Batch) {
        for &(ch, idx) in &batch.entries {
            self.channels[ch as usize].release(idx);
        }
    }

    pub fn entry(&self, channel: u16, index: u32) -> &Arc<WriteBufferEntry> {
        &self.channels[channel as usize].entries[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_qdepth_limit() {
        let l2p = L2pTable::new(0);
        let ch = WriteBufferChannel::new(0, 4, 512);
        ch.qdepth_limit.store(2, Ordering::Relaxed);
        assert!(ch.acquire(&l2p, EntryFlags::empty()).is_some());
        assert!(ch.acquire(&l2p, EntryFlags::empty()).is_some());
        assert!(ch.acquire(&l2p, EntryFlags::empty()).is_none());
        // internal writes bypass the limit.
        assert!(ch.acquire(&l2p, EntryFlags::INTERNAL).is_some());
    }

    #[test]
    fn batcher_rotates_start_channel_for_fairness() {
        let wb = WriteBuffer::new(2, 4, 512, 2);
        wb.channels[0].push_submit(0);
        wb.channels[0].push_submit(1);
        wb.channels[1].push_submit(0);
        wb.channels[1].push_submit(1);
        let first = wb.pop_batch().unwrap();
        let second = wb.pop_batch().unwrap();
        // the two pops should not both start from the same channel.
        assert_ne!(first.entries[0].0, second.entries[0].0);
    }

    #[test]
    fn eviction_only_rewrites_l2p_when_still_pointing_at_entry() {
        let l2p = L2pTable::new(1);
        let ch = WriteBufferChannel::new(0, 1, 512);
        let entry = ch.acquire(&l2p, EntryFlags::empty()).unwrap();
        ch.fill(&entry, 0, &vec![1u8; 512], None);
        l2p.set(0, entry.addr());
        entry.inner.lock().persisted_addr = Addr::Base(42);
        entry.valid.store(true, Ordering::Release);
        ch.release(entry.index);
        // re-acquiring the only entry must evict it and roll the L2P
        // forward to its persisted address.
        let _entry2 = ch.acquire(&l2p, EntryFlags::empty()).unwrap();
        assert_eq!(l2p.get(0), Addr::Base(42));
    }
}
