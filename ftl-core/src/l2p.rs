//! The logical-to-physical map (§3 "L2P table", §4.5).
//!
//! One fine-grained spinlock per LBA rather than one lock over the whole
//! table: the update protocol only ever needs to briefly hold a single
//! slot still, so there is no value in a table-wide lock (§5: "No global
//! lock exists over the L2P").

use crate::address::{band_of, Addr};
use crate::band::Band;
use crate::config::Geometry;

pub struct L2pTable {
    entries: Vec<mutex::SpinLock<Addr>>,
}

impl L2pTable {
    pub fn new(num_lbas: u64) -> Self {
        L2pTable {
            entries: (0..num_lbas).map(|_| mutex::SpinLock::new(Addr::Invalid)).collect(),
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, lba: u64) -> Addr {
        *self.entries[lba as usize].lock()
    }

    pub fn set(&self, lba: u64, addr: Addr) {
        *self.entries[lba as usize].lock() = addr;
    }

    /// Stores `new` only if the current value still equals `expect`; used
    /// by the "weak write" relocator path (§4.5, §4.10) so a concurrent
    /// newer write is never clobbered by a stale relocation.
    pub fn compare_and_set(&self, lba: u64, expect: Addr, new: Addr) -> bool {
        let mut slot = self.entries[lba as usize].lock();
        if *slot == expect {
            *slot = new;
            true
        } else {
            false
        }
    }
}

/// Clears `valid_map[offset_of(addr)]` on the band that owns a base
/// address, under that band's lock (§4.5 step 3, "invalidate_addr_unlocked").
/// A no-op if the address no longer resolves inside its band (the band may
/// have been recycled since, in which case the stale offset means nothing).
fn invalidate_base(bands: &[Band], geo: &Geometry, off: u64) {
    let band = &bands[band_of(geo, Addr::Base(off)) as usize];
    if let Some(offset) = band.block_offset_from_address(geo, Addr::Base(off)) {
        band.md.lock().invalidate_offset(offset as usize);
    }
}

/// The full LBA update protocol of §4.5: read-old, invalidate-old,
/// store-new. Used by ordinary (non-relocator) writes, where the new
/// mapping always wins regardless of what raced it ("last-writer-wins",
/// §4.11).
pub fn install(l2p: &L2pTable, bands: &[Band], geo: &Geometry, lba: u64, new_addr: Addr) {
    let old = l2p.get(lba);
    if let Addr::Base(off) = old {
        invalidate_base(bands, geo, off);
    }
    l2p.set(lba, new_addr);
}

/// The "weak write" variant (§4.5, §4.10): only installs `new_addr` if the
/// LBA still maps to `expect` (the address the relocator observed when it
/// read this block). If a genuine write raced and already replaced the
/// mapping, the relocated copy is simply dropped — the LBA's data is safe
/// at whatever the newer write produced. Returns whether the install took
/// effect.
pub fn install_weak(l2p: &L2pTable, bands: &[Band], geo: &Geometry, lba: u64, expect: Addr, new_addr: Addr) -> bool {
    if !l2p.compare_and_set(lba, expect, new_addr) {
        return false;
    }
    if let Addr::Base(off) = expect {
        invalidate_base(bands, geo, off);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_invalid() {
        let l2p = L2pTable::new(8);
        for lba in 0..8 {
            assert_eq!(l2p.get(lba), Addr::Invalid);
        }
    }

    #[test]
    fn compare_and_set_rejects_stale_expectation() {
        let l2p = L2pTable::new(1);
        l2p.set(0, Addr::Base(5));
        assert!(!l2p.compare_and_set(0, Addr::Base(4), Addr::Base(9)));
        assert_eq!(l2p.get(0), Addr::Base(5));
        assert!(l2p.compare_and_set(0, Addr::Base(5), Addr::Base(9)));
        assert_eq!(l2p.get(0), Addr::Base(9));
    }
}
