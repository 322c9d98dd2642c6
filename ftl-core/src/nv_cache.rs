//! Optional ring-structured write-ahead cache (§3 "NV-cache state", §4.7).
//!
//! The cache is a ring of data blocks behind a single header block. Phase
//! tagging disambiguates live entries from stale leftovers of an earlier
//! pass after the ring wraps, without needing to zero the whole ring.

use uuid::Uuid;

use crate::metadata::next_phase;

/// Per-block metadata packed into the cache device's out-of-band region:
/// the LBA this block holds, and the phase it was written under. Packed
/// into 8 bytes (phase in the top byte) so a device with the protocol
/// minimum `md_size == 8` still works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvCacheBlockMd {
    pub lba: u64,
    pub phase: u8,
}

const LBA_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

impl NvCacheBlockMd {
    pub fn pack(&self) -> [u8; 8] {
        let word = (self.lba & LBA_MASK) | ((self.phase as u64) << 56);
        word.to_ne_bytes()
    }

    pub fn unpack(bytes: &[u8]) -> Self {
        let word = u64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        NvCacheBlockMd { lba: word & LBA_MASK, phase: (word >> 56) as u8 }
    }
}

#[derive(Debug)]
struct State {
    uuid: Uuid,
    phase: u8,
    current_addr: u64,
    num_available: u64,
    num_data_blocks: u64,
    ready: bool,
}

pub struct NvCache {
    state: mutex::SpinLock<State>,
}

/// Outcome of a `reserve` call (§4.7).
pub enum Reservation {
    Granted { cache_addr: u64, granted_blocks: u64, phase: u8 },
    /// The ring just wrapped: a new header must be written (new phase) and
    /// `complete_wrap` called before the cache accepts reservations again.
    WrapPending,
    /// Not ready (mid-wrap, or a prior header write failed); callers must
    /// bypass the cache for this write.
    NotReady,
}

impl NvCache {
    pub fn new(uuid: Uuid, num_data_blocks: u64) -> Self {
        NvCache {
            state: mutex::SpinLock::new(State {
                uuid,
                phase: 1,
                current_addr: 0,
                num_available: num_data_blocks,
                num_data_blocks,
                ready: true,
            }),
        }
    }

    pub fn phase(&self) -> u8 {
        self.state.lock().phase
    }

    pub fn uuid(&self) -> Uuid {
        self.state.lock().uuid
    }

    /// `reserve(n_blocks)` (§4.7): returns the next contiguous range in the
    /// ring, or signals that a wrap just happened and a new header needs
    /// writing before reservations can resume.
    pub fn reserve(&self, n_blocks: u64) -> Reservation {
        let mut st = self.state.lock();
        if !st.ready {
            return Reservation::NotReady;
        }
        if st.current_addr >= st.num_data_blocks {
            st.ready = false;
            st.phase = next_phase(st.phase);
            st.current_addr = 0;
            return Reservation::WrapPending;
        }
        let remaining = st.num_data_blocks - st.current_addr;
        let granted = n_blocks.min(remaining);
        let addr = st.current_addr;
        st.current_addr += granted;
        st.num_available = st.num_available.saturating_sub(granted);
        Reservation::Granted { cache_addr: addr, granted_blocks: granted, phase: st.phase }
    }

    /// Invariant 5 helper: `num_available` plus in-flight writes must never
    /// exceed `num_data_blocks`; callers add back on write failure.
    pub fn release_unused(&self, n_blocks: u64) {
        let mut st = self.state.lock();
        st.num_available = (st.num_available + n_blocks).min(st.num_data_blocks);
    }

    /// Called after a new wrap header has been durably written.
    pub fn complete_wrap(&self) {
        self.state.lock().ready = true;
    }

    pub fn mark_not_ready(&self) {
        self.state.lock().ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn current_addr(&self) -> u64 {
        self.state.lock().current_addr
    }

    /// Restores the cursor after a clean shutdown (§4.12); on a dirty
    /// restart the caller instead rediscovers the cursor by scanning phases.
    pub fn restore_cursor(&self, addr: u64, phase: u8) {
        let mut st = self.state.lock();
        st.current_addr = addr;
        st.phase = phase;
        st.ready = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_wraps_and_advances_phase() {
        let cache = NvCache::new(Uuid::from_u128(1), 10);
        match cache.reserve(6) {
            Reservation::Granted { cache_addr, granted_blocks, phase } => {
                assert_eq!(cache_addr, 0);
                assert_eq!(granted_blocks, 6);
                assert_eq!(phase, 1);
            }
            _ => panic!("expected grant"),
        }
        match cache.reserve(6) {
            Reservation::Granted { cache_addr, granted_blocks, .. } => {
                assert_eq!(cache_addr, 6);
                assert_eq!(granted_blocks, 4);
            }
            _ => panic!("expected partial grant at ring end"),
        }
        // ring is now exactly exhausted; next reserve detects the wrap.
        assert!(matches!(cache.reserve(1), Reservation::WrapPending));
        assert!(matches!(cache.reserve(1), Reservation::NotReady));
        cache.complete_wrap();
        match cache.reserve(1) {
            Reservation::Granted { cache_addr, phase, .. } => {
                assert_eq!(cache_addr, 0);
                assert_eq!(phase, 2);
            }
            _ => panic!("expected grant after wrap completes"),
        }
    }

    #[test]
    fn block_md_round_trips_through_packing() {
        let md = NvCacheBlockMd { lba: 123_456, phase: 3 };
        let packed = md.pack();
        assert_eq!(NvCacheBlockMd::unpack(&packed), md);
    }
}
