//! The band abstraction (§3 "Band", §4.3, §4.4): a cross-parallel-unit
//! stripe of zones sharing a zone index, treated as one sequential write
//! target. Grounded closely on `ftl_band.c`'s offset arithmetic and state
//! machine, but the cyclic band/zone/device pointers become a plain arena
//! (`FtlDevice` owns `Vec<Band>` indexed by id) and zones are inlined
//! rather than linked through an intrusive queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use crate::address::{Addr, LBA_INVALID};
use crate::bitset::BitSet;
use crate::config::Geometry;
use crate::zone::{Zone, ZoneState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandState {
    Free,
    Prep,
    Opening,
    Open,
    Full,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandType {
    Compaction,
    Gc,
}

/// The fields guarded by the band's single `lba_map.lock` (§4.5, §5):
/// the LBA map and the valid-block bitmap are always updated together.
#[derive(Debug)]
pub struct BandMdState {
    pub lba_map: Vec<u64>,
    pub valid_map: BitSet,
    pub num_valid: usize,
}

impl BandMdState {
    fn new(usable_blocks: usize) -> Self {
        BandMdState {
            lba_map: vec![LBA_INVALID; usable_blocks],
            valid_map: BitSet::new(usable_blocks),
            num_valid: 0,
        }
    }

    /// `ftl_band_set_addr`: records that block `offset` now holds `lba`.
    pub fn set_addr(&mut self, offset: usize, lba: u64) {
        self.lba_map[offset] = lba;
        if !self.valid_map.get(offset) {
            self.valid_map.set(offset);
            self.num_valid += 1;
        }
    }

    /// The "invalidate_addr_unlocked" step of §4.5: clears ownership of
    /// `offset`, assuming the caller already holds this band's lock.
    pub fn invalidate_offset(&mut self, offset: usize) {
        if self.valid_map.get(offset) {
            self.valid_map.clear(offset);
            self.num_valid -= 1;
        }
    }

    pub fn invariant_holds(&self) -> bool {
        self.valid_map.popcount() == self.num_valid
    }
}

pub struct Band {
    pub id: u64,
    pub state: BandState,
    pub btype: Option<BandType>,
    pub write_count: u64,
    pub seq_number: u64,
    pub uuid: Uuid,
    /// One zone per parallel unit, indexed by creation-time slot. Offline
    /// zones stay in place (marked `Offline`) rather than being removed,
    /// so `parallel_unit` indices remain stable.
    pub zones: Vec<Zone>,
    pub md: mutex::SpinLock<BandMdState>,
    /// Band ids relocated *into* this band; it cannot be reused until all
    /// of them have themselves closed (§4.10 item 5).
    pub reloc_bitmap: HashSet<u64>,
    /// Outstanding relocations still writing data sourced *from* this band.
    pub num_reloc_bands: u32,
    pub ref_count: AtomicUsize,
    pub lba_map_checksum: u32,
    logical_offset: u64,
}

impl Band {
    pub fn new(id: u64, geo: &Geometry, uuid: Uuid) -> Self {
        let zones = (0..geo.num_parallel_units)
            .map(|pu| {
                // Physical first-block offset of this (band, parallel
                // unit) zone in the base device's flat address space —
                // must agree with `addr_from_logical_offset`'s
                // `band_id * blocks_per_band() + pu * zone_size + ...`.
                let zone_id = id * geo.blocks_per_band() + pu as u64 * geo.zone_size;
                Zone::new(zone_id, pu, geo.zone_size)
            })
            .collect();
        let usable_blocks = geo.usable_blocks_per_band() as usize;
        Band {
            id,
            state: BandState::Free,
            btype: None,
            write_count: 0,
            seq_number: 0,
            uuid,
            zones,
            md: mutex::SpinLock::new(BandMdState::new(usable_blocks)),
            reloc_bitmap: HashSet::new(),
            num_reloc_bands: 0,
            ref_count: AtomicUsize::new(0),
            lba_map_checksum: 0,
            logical_offset: 0,
        }
    }

    pub fn num_zones(&self) -> u64 {
        self.zones.iter().filter(|z| z.state != ZoneState::Offline).count() as u64
    }

    fn active_zones(&self) -> Vec<&Zone> {
        self.zones.iter().filter(|z| z.state != ZoneState::Offline).collect()
    }

    /// `usable_blocks`, recomputed against the *current* number of
    /// operational zones (shrinks as zones go offline, §4.3).
    pub fn usable_blocks(&self, geo: &Geometry) -> u64 {
        self.num_zones() * (geo.zone_size - geo.head_md_blocks - geo.tail_md_blocks)
    }

    pub fn is_empty(&self) -> bool {
        self.md.lock().num_valid == 0
    }

    // -- state machine (mirrors ftl_band_set_state's transition table) --

    pub fn set_state(&mut self, next: BandState) {
        let allowed = matches!(
            (self.state, next),
            (BandState::Free, BandState::Prep)
                | (BandState::Prep, BandState::Opening)
                | (BandState::Opening, BandState::Open)
                | (BandState::Open, BandState::Full)
                | (BandState::Full, BandState::Closing)
                | (BandState::Closing, BandState::Closed)
                | (BandState::Closed, BandState::Free)
        );
        assert!(allowed, "illegal band transition {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn set_type(&mut self, t: BandType) {
        self.btype = Some(t);
    }

    /// FREE -> PREP: caller has already submitted zone resets.
    pub fn begin_erase(&mut self) {
        self.set_state(BandState::Prep);
        self.write_count += 1;
    }

    /// PREP -> OPENING: allocate md (already zero-sized to usable_blocks
    /// at construction) and reset the write iterator.
    pub fn begin_open(&mut self, geo: &Geometry) {
        self.set_state(BandState::Opening);
        self.logical_offset = 0;
        *self.md.lock() = BandMdState::new(geo.usable_blocks_per_band() as usize);
    }

    /// OPENING -> OPEN, on successful head-metadata write.
    pub fn confirm_open(&mut self) {
        self.set_state(BandState::Open);
    }

    /// Forces the write iterator past the end of the band, as when padding
    /// out the rest of a band during halt or an early overwrite-driven
    /// close.
    pub fn force_full(&mut self, geo: &Geometry) {
        self.logical_offset = self.usable_blocks(geo);
    }

    pub fn is_full(&self, geo: &Geometry) -> bool {
        self.logical_offset >= self.usable_blocks(geo)
    }

    // -- address translation within this band's current zone layout --

    fn logical_offset_of(&self, geo: &Geometry, addr: Addr) -> Option<u64> {
        let raw = addr.as_base()?;
        let band_start = self.id * geo.blocks_per_band();
        let band_rel = raw.checked_sub(band_start)?;
        let pu_slot = band_rel / geo.zone_size;
        let zone_off = band_rel % geo.zone_size;
        let active = self.active_zones();
        let pos = active.iter().position(|z| z.parallel_unit == pu_slot as u32)?;
        let data_off = zone_off.checked_sub(geo.head_md_blocks)?;
        let stripe_round = data_off / geo.xfer_size;
        let within = data_off % geo.xfer_size;
        Some(stripe_round * active.len() as u64 * geo.xfer_size + pos as u64 * geo.xfer_size + within)
    }

    fn addr_from_logical_offset(&self, geo: &Geometry, logical: u64) -> Addr {
        let active = self.active_zones();
        let num_active = active.len() as u64;
        let stripe = logical / geo.xfer_size;
        let within = logical % geo.xfer_size;
        let pos = (stripe % num_active) as usize;
        let stripe_round = stripe / num_active;
        let zone_off = geo.head_md_blocks + stripe_round * geo.xfer_size + within;
        let pu = active[pos].parallel_unit as u64;
        let band_rel = pu * geo.zone_size + zone_off;
        Addr::Base(self.id * geo.blocks_per_band() + band_rel)
    }

    /// `next_xfer_address(band, addr, n)` (§4.1, §4.3): advances `addr` by
    /// `n` blocks following the round-robin striping rule across
    /// operational parallel units, `Addr::Invalid` once the band is
    /// exhausted.
    pub fn next_xfer_address(&self, geo: &Geometry, addr: Addr, n: u64) -> Addr {
        let cur = match self.logical_offset_of(geo, addr) {
            Some(v) => v,
            None => return Addr::Invalid,
        };
        let next = cur + n;
        if next >= self.usable_blocks(geo) {
            return Addr::Invalid;
        }
        self.addr_from_logical_offset(geo, next)
    }

    /// The band's first writable data address (used to open the iterator).
    pub fn first_address(&self, geo: &Geometry) -> Addr {
        self.addr_from_logical_offset(geo, 0)
    }

    pub fn address_from_block_offset(&self, geo: &Geometry, off: u64) -> Addr {
        self.addr_from_logical_offset(geo, off)
    }

    pub fn block_offset_from_address(&self, geo: &Geometry, addr: Addr) -> Option<u64> {
        self.logical_offset_of(geo, addr)
    }

    /// Advances the band's own write-iterator by `xfer_size` blocks,
    /// returning the address the caller should write the *next* batch
    /// at (or `Addr::Invalid` once the band is full). Mirrors the wptr's
    /// use of `next_xfer_address` against its own running position.
    pub fn advance_iter(&mut self, geo: &Geometry) -> Addr {
        if self.logical_offset >= self.usable_blocks(geo) {
            return Addr::Invalid;
        }
        let addr = self.addr_from_logical_offset(geo, self.logical_offset);
        self.logical_offset += geo.xfer_size;
        addr
    }

    /// Index into `self.zones` of the zone a base address belongs to.
    fn zone_index_for_addr(&self, geo: &Geometry, addr: Addr) -> Option<usize> {
        let raw = addr.as_base()?;
        let band_start = self.id * geo.blocks_per_band();
        let band_rel = raw.checked_sub(band_start)?;
        let pu_slot = band_rel / geo.zone_size;
        self.zones.iter().position(|z| z.parallel_unit == pu_slot as u32)
    }

    /// The zone the write iterator is currently positioned in, `None` once
    /// the band is full (§4.8: the write-pointer readiness check consults
    /// this zone's state rather than only the band's).
    pub fn current_zone_index(&self, geo: &Geometry) -> Option<usize> {
        if self.is_full(geo) {
            return None;
        }
        let addr = self.addr_from_logical_offset(geo, self.logical_offset);
        self.zone_index_for_addr(geo, addr)
    }

    /// Index of the zone a just-written base address landed in, for the
    /// wptr completion step (§4.8 items 6-7) to update that zone's busy
    /// flag and write pointer.
    pub fn zone_index_for_written_addr(&self, geo: &Geometry, addr: Addr) -> Option<usize> {
        self.zone_index_for_addr(geo, addr)
    }

    /// Marks a zone offline after an erase/write failure (§4.2): removed
    /// from the striping rotation, `num_zones` shrinks, and the band's
    /// tail-metadata placement is recomputed implicitly since
    /// `usable_blocks` now reflects the smaller operational count.
    pub fn mark_zone_offline(&mut self, parallel_unit: u32) {
        if let Some(z) = self.zones.iter_mut().find(|z| z.parallel_unit == parallel_unit) {
            z.mark_offline();
        }
    }

    pub fn acquire_lba_map(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if this was the last reference (caller may release
    /// the LBA map storage / transition the band onward).
    pub fn release_lba_map(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo3() -> Geometry {
        Geometry {
            block_size: 4096,
            zone_size: 128,
            num_zones: 4,
            num_parallel_units: 3,
            xfer_size: 16,
            head_md_blocks: 0,
            tail_md_blocks: 0,
        }
    }

    #[test]
    fn write_pointer_striping() {
        let geo = geo3();
        let mut band = Band::new(0, &geo, Uuid::from_u128(1));
        band.begin_erase();
        band.begin_open(&geo);
        let start = band.first_address(&geo);
        let next = band.next_xfer_address(&geo, start, 16);
        // lands at the start of the next parallel unit (pu=1, offset 0 within its zone).
        assert_eq!(next, Addr::Base(1 * geo.zone_size));

        let mut cur = start;
        for _ in 0..3 {
            cur = band.next_xfer_address(&geo, cur, 16);
        }
        assert_eq!(cur, Addr::Base(16));

        let mut cur = start;
        for _ in 0..24 {
            cur = band.next_xfer_address(&geo, cur, 16);
        }
        assert_eq!(cur, Addr::Invalid);
    }

    #[test]
    fn set_addr_and_invalidate_keep_popcount_in_sync() {
        let geo = geo3();
        let band = Band::new(0, &geo, Uuid::from_u128(1));
        {
            let mut md = band.md.lock();
            md.set_addr(0, 100);
            md.set_addr(1, 101);
            assert_eq!(md.num_valid, 2);
            assert!(md.invariant_holds());
            md.invalidate_offset(0);
            assert_eq!(md.num_valid, 1);
            assert!(md.invariant_holds());
        }
    }

    #[test]
    fn offline_zone_shrinks_usable_blocks() {
        let geo = geo3();
        let mut band = Band::new(0, &geo, Uuid::from_u128(1));
        let before = band.usable_blocks(&geo);
        band.mark_zone_offline(1);
        assert_eq!(band.num_zones(), 2);
        assert_eq!(band.usable_blocks(&geo), before - geo.zone_size);
    }
}
