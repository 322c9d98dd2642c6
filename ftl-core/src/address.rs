//! Physical address encoding and band-relative arithmetic (§3 "Physical
//! Address", §4.1).
//!
//! A C union tagged by a `cached` bit becomes a Rust enum: `Base` addresses
//! are offsets on the zoned device, `Cached` addresses name a write-buffer
//! slot, and `Invalid` is the explicit sentinel (no `u64::MAX` punning).

use crate::config::Geometry;

pub const LBA_INVALID: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    /// Offset in blocks on the zoned device, `0..base_blocks`.
    Base(u64),
    /// A write-buffer slot: `(channel_index, entry_index)`.
    Cached { channel: u16, index: u32 },
    Invalid,
}

impl Addr {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Addr::Invalid)
    }

    pub fn as_base(&self) -> Option<u64> {
        match self {
            Addr::Base(off) => Some(*off),
            _ => None,
        }
    }

    pub fn as_cached(&self) -> Option<(u16, u32)> {
        match self {
            Addr::Cached { channel, index } => Some((*channel, *index)),
            _ => None,
        }
    }
}

/// `band_of(addr) -> band_id`: `addr / blocks_per_band` for base addresses.
/// Panics on a non-base address; callers must branch on the tag first.
pub fn band_of(geo: &Geometry, addr: Addr) -> u64 {
    let off = addr.as_base().expect("band_of called on a non-base address");
    off / geo.blocks_per_band()
}

/// Offset of `addr` within its band, `0..blocks_per_band`.
pub fn offset_in_band(geo: &Geometry, addr: Addr) -> u64 {
    let off = addr.as_base().expect("offset_in_band called on a non-base address");
    off % geo.blocks_per_band()
}

/// `parallel_unit_of(addr) -> pu`: modular arithmetic over `(zone_size,
/// num_parallel_units)` on the band-relative offset.
pub fn parallel_unit_of(geo: &Geometry, addr: Addr) -> u32 {
    (offset_in_band(geo, addr) / geo.zone_size) as u32
}

/// `zone_offset(addr)`: the block offset within the addr's zone.
pub fn zone_offset(geo: &Geometry, addr: Addr) -> u64 {
    offset_in_band(geo, addr) % geo.zone_size
}

/// Inverse of `block_offset_from_address`: reconstructs the band-relative
/// address from a `[0, usable_blocks)` offset, striping across parallel
/// units in `xfer_size` chunks the same way `next_xfer_address` advances.
pub fn address_from_block_offset(geo: &Geometry, band_id: u64, off: u64) -> Addr {
    let stripe = off / geo.xfer_size;
    let within_stripe = off % geo.xfer_size;
    let pu = (stripe % geo.num_parallel_units as u64) as u32;
    let stripe_round = stripe / geo.num_parallel_units as u64;
    let zone_off = geo.head_md_blocks + stripe_round * geo.xfer_size + within_stripe;
    let band_rel = pu as u64 * geo.zone_size + zone_off;
    Addr::Base(band_id * geo.blocks_per_band() + band_rel)
}

/// Inverse of `address_from_block_offset`.
pub fn block_offset_from_address(geo: &Geometry, addr: Addr) -> u64 {
    let pu = parallel_unit_of(geo, addr) as u64;
    let zoff = zone_offset(geo, addr);
    debug_assert!(zoff >= geo.head_md_blocks, "address points into head metadata");
    let stripe_round = (zoff - geo.head_md_blocks) / geo.xfer_size;
    let within_stripe = (zoff - geo.head_md_blocks) % geo.xfer_size;
    let stripe = stripe_round * geo.num_parallel_units as u64 + pu;
    stripe * geo.xfer_size + within_stripe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            block_size: 4096,
            zone_size: 128,
            num_zones: 20,
            num_parallel_units: 12,
            xfer_size: 16,
            head_md_blocks: 1,
            tail_md_blocks: 1,
        }
    }

    #[test]
    fn round_trip_block_offset() {
        let geo = geo();
        for off in [0u64, 15, 16, 31, 32, 100, 191] {
            let addr = address_from_block_offset(&geo, 3, off);
            assert_eq!(block_offset_from_address(&geo, addr), off);
        }
    }

    #[test]
    fn band_and_pu_decode() {
        let geo = geo();
        let addr = address_from_block_offset(&geo, 2, 0);
        assert_eq!(band_of(&geo, addr), 2);
        assert_eq!(parallel_unit_of(&geo, addr), 0);
        assert_eq!(zone_offset(&geo, addr), geo.head_md_blocks);
    }
}
