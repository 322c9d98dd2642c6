//! The write pointer: the cursor inside the currently-open band (§3 "Write
//! Pointer", §4.8). Exactly one write pointer exists per open band
//! (invariant 3).
//!
//! The device trait this crate consumes (`ZonedBlockDevice`) is
//! synchronous, unlike the completion-callback bdev layer this component
//! is grounded on (`ftl_io.c`/`ftl_band.c`'s wptr). The pending/retry
//! queues below are kept anyway: they are exactly where an asynchronous
//! backend's `EAGAIN` would be handled, they just never accumulate work
//! against the synchronous in-memory device used by this crate's tests.

use std::sync::atomic::Ordering;

use log::{debug, warn};
use uuid::Uuid;

use crate::address::Addr;
use crate::band::{Band, BandState};
use crate::config::Geometry;
use crate::error::{FtlError, FtlResult};
use crate::l2p::L2pTable;
use crate::metadata::{HeadMetadata, TailMetadata};
use crate::write_buffer::{Batch, EntryFlags, WriteBuffer};
use ftl_device_api::ZonedBlockDevice;

pub struct WritePointer {
    pub band_id: u64,
    /// Batches that failed to write (`EAGAIN`-equivalent) and must be
    /// resubmitted before any new batch is drained.
    pending: Vec<Batch>,
    pub flush_requested: bool,
    pub closed: bool,
}

/// What a `process_writes` call accomplished, so the caller (the device's
/// per-iteration poll, which alone may touch the free/closed band lists,
/// §5) can act on a band close without this module reaching outside its
/// own band/write-buffer concerns.
#[derive(Debug, Default)]
pub struct WriteProgress {
    pub busy: bool,
    pub band_closed: bool,
    /// Source bands whose last outstanding relocation-destination just
    /// closed (§4.10 item 5: a source band cannot be reused until every
    /// band relocated data was moved into has itself closed). The caller
    /// should additionally check `num_valid == 0` on these before moving
    /// them to the free list — closing here only clears the *dependency*,
    /// not the band's own live-data count.
    pub reloc_deps_cleared: Vec<u64>,
}

impl WritePointer {
    pub fn new(band_id: u64) -> Self {
        WritePointer { band_id, pending: Vec::new(), flush_requested: false, closed: false }
    }

    /// §4.8: ready iff the band itself is `Open` and its current zone is
    /// writable. Offline zones are already excluded from a band's active
    /// rotation (`addr_from_logical_offset` only strides over them), so the
    /// write iterator never actually lands on one; this still consults
    /// `Zone::is_writable` rather than the band state alone so a zone left
    /// `busy` by a submission still in flight holds the wptr back.
    fn band_ready(band: &Band, geo: &Geometry) -> bool {
        if band.state != BandState::Open {
            return false;
        }
        match band.current_zone_index(geo) {
            Some(idx) => band.zones[idx].is_writable(),
            None => true, // band already full: let process_writes close it
        }
    }

    /// `process_writes()` (§4.8): drains the pending queue, pulls one
    /// batch from the write buffer, writes it at the band's next stripe,
    /// and on completion commits the band's valid-block bitmap and LBA
    /// map. `bands` is the whole arena so a relocated entry's source band
    /// can be cross-referenced against the destination band being written
    /// here (§4.10 item 5).
    pub fn process_writes(
        &mut self,
        bands: &mut [Band],
        geo: &Geometry,
        wb: &WriteBuffer,
        l2p: &L2pTable,
        base: &dyn ZonedBlockDevice,
        halt: bool,
    ) -> FtlResult<WriteProgress> {
        if !Self::band_ready(&bands[self.band_id as usize], geo) {
            return Ok(WriteProgress::default());
        }

        if let Some(batch) = self.pending.pop() {
            return self.submit_batch(bands, geo, wb, l2p, base, batch);
        }

        if bands[self.band_id as usize].is_full(geo) {
            return self.close_if_drained(bands, geo, base);
        }

        let batch = match wb.pop_batch() {
            Some(b) => b,
            None => {
                if halt || self.flush_requested {
                    // No user data pending: pad with an internal batch so
                    // the band can close.
                    return self.pad_and_close(bands, geo, wb, l2p, base);
                }
                return Ok(WriteProgress::default());
            }
        };

        self.submit_batch(bands, geo, wb, l2p, base, batch)
    }

    fn submit_batch(
        &mut self,
        bands: &mut [Band],
        geo: &Geometry,
        wb: &WriteBuffer,
        l2p: &L2pTable,
        base: &dyn ZonedBlockDevice,
        batch: Batch,
    ) -> FtlResult<WriteProgress> {
        let band = &mut bands[self.band_id as usize];
        let addr = band.advance_iter(geo);
        let base_off = match addr {
            Addr::Base(off) => off,
            Addr::Invalid => {
                // Band filled exactly on a batch boundary; requeue and close.
                self.pending.push(batch);
                return Ok(WriteProgress { busy: true, ..Default::default() });
            }
            Addr::Cached { .. } => unreachable!("band addresses are always base form"),
        };

        let payloads: Vec<Vec<u8>> = batch
            .entries
            .iter()
            .map(|&(ch, idx)| wb.entry(ch, idx).inner.lock().payload.clone())
            .collect();
        let iovs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();

        let band = &mut bands[self.band_id as usize];
        let zone_idx = band
            .zone_index_for_written_addr(geo, Addr::Base(base_off))
            .expect("written address must resolve to one of its own band's zones");
        // §4.3/§4.8: the target zone is busy for the duration of the
        // submission, cleared (and its write pointer advanced) only on
        // completion below.
        band.zones[zone_idx].busy = true;
        let write_result = if base.supports_append() {
            base.zone_appendv(band.id * geo.zone_size, &iovs).map(|_| ())
        } else {
            base.writev_blocks(base_off, &iovs)
        };

        if let Err(e) = write_result {
            warn!("band {} write at {} failed: {:?}; requeued", band.id, base_off, e);
            bands[self.band_id as usize].zones[zone_idx].busy = false;
            self.pending.push(batch);
            return Ok(WriteProgress::default());
        }
        bands[self.band_id as usize].zones[zone_idx].advance(geo.xfer_size);

        let mut reloc_sources = Vec::new();
        for (i, &(ch, idx)) in batch.entries.iter().enumerate() {
            let entry = wb.entry(ch, idx);
            let block_addr = Addr::Base(base_off + i as u64);
            let band = &mut bands[self.band_id as usize];
            let offset = band
                .block_offset_from_address(geo, block_addr)
                .expect("written address must resolve inside its own band") as usize;
            let mut inner = entry.inner.lock();
            if l2p.get(inner.lba) == entry.addr() {
                band.md.lock().set_addr(offset, inner.lba);
                inner.persisted_addr = block_addr;
                entry.valid.store(true, std::sync::atomic::Ordering::Release);
                if let Some(src) = inner.source_band {
                    if src != band.id {
                        reloc_sources.push(src);
                    }
                }
            }
            drop(inner);
            wb.channels[ch as usize].release(idx);
        }

        // Record the relocation dependency (§4.10 item 5): this band
        // cannot be considered "done receiving" a source until it closes,
        // and each source cannot be reused until every such destination
        // has closed. `reloc_bitmap` is a set, so a source only bumps its
        // dependent's counter the first time it's seen from this band.
        let band_id = self.band_id;
        for src in reloc_sources {
            let already = bands[band_id as usize].reloc_bitmap.contains(&src);
            if !already {
                bands[band_id as usize].reloc_bitmap.insert(src);
                bands[src as usize].num_reloc_bands += 1;
            }
        }

        if bands[self.band_id as usize].is_full(geo) {
            return self.close_if_drained(bands, geo, base);
        }
        Ok(WriteProgress { busy: true, ..Default::default() })
    }

    /// Pads the remaining open slots of a band with internally-sourced
    /// zero batches so it can be closed on halt or an explicit flush.
    fn pad_and_close(
        &mut self,
        bands: &mut [Band],
        geo: &Geometry,
        wb: &WriteBuffer,
        l2p: &L2pTable,
        base: &dyn ZonedBlockDevice,
    ) -> FtlResult<WriteProgress> {
        let block_size = geo.block_size;
        let channel = 0u16;
        let mut entries = Vec::new();
        for _ in 0..geo.xfer_size {
            match wb.channels[channel as usize].acquire(l2p, EntryFlags::INTERNAL) {
                Some(entry) => {
                    wb.channels[channel as usize].fill(&entry, crate::address::LBA_INVALID, &vec![0u8; block_size], None);
                    entries.push((channel, entry.index));
                }
                None => break,
            }
        }
        if entries.is_empty() {
            bands[self.band_id as usize].force_full(geo);
            return self.close_if_drained(bands, geo, base);
        }
        self.submit_batch(bands, geo, wb, l2p, base, Batch { entries })
    }

    /// FULL -> CLOSING -> CLOSED (§4.3): writes the tail metadata once no
    /// in-flight children remain (our synchronous model has none by the
    /// time this is reached), releases the LBA map, and clears this
    /// band's dependency on each of its relocation sources.
    fn close_if_drained(&mut self, bands: &mut [Band], geo: &Geometry, base: &dyn ZonedBlockDevice) -> FtlResult<WriteProgress> {
        if !self.pending.is_empty() {
            return Ok(WriteProgress::default());
        }
        let band = &mut bands[self.band_id as usize];
        if band.state == BandState::Open {
            band.set_state(BandState::Full);
        }
        if band.ref_count.load(Ordering::Acquire) != 0 {
            // Still has readers or an active relocator resolving addresses
            // into this band (§3 "ref_count"); retry next iteration rather
            // than reclaiming it out from under them.
            return Ok(WriteProgress::default());
        }
        band.set_state(BandState::Closing);

        let md = band.md.lock();
        let tail = TailMetadata {
            head: HeadMetadata {
                uuid: band.uuid,
                band_id: band.id,
                write_count: band.write_count,
                seq_number: band.seq_number,
            },
            lba_map: md.lba_map.clone(),
        };
        let checksum = tail.checksum();
        drop(md);
        band.lba_map_checksum = checksum;
        let packed = pad_to_blocks(tail.pack(), geo.block_size, geo.tail_md_blocks);
        let tail_addr = tail_md_physical_addr(band, geo);
        if let Err(e) = base.write_blocks(tail_addr, &packed) {
            warn!("band {} tail metadata write failed: {:?}", band.id, e);
            return Err(FtlError::Io);
        }

        let band = &mut bands[self.band_id as usize];
        band.set_state(BandState::Closed);
        self.closed = true;
        let sources: Vec<u64> = band.reloc_bitmap.drain().collect();
        debug!("band {} closed, seq={}", band.id, band.seq_number);

        let mut reloc_deps_cleared = Vec::new();
        for src in sources {
            let src_band = &mut bands[src as usize];
            src_band.num_reloc_bands = src_band.num_reloc_bands.saturating_sub(1);
            if src_band.num_reloc_bands == 0 {
                reloc_deps_cleared.push(src);
            }
        }

        Ok(WriteProgress { busy: true, band_closed: true, reloc_deps_cleared })
    }

    pub fn write_head_metadata(band: &Band, geo: &Geometry, base: &dyn ZonedBlockDevice) -> FtlResult<()> {
        let head = HeadMetadata {
            uuid: band.uuid,
            band_id: band.id,
            write_count: band.write_count,
            seq_number: band.seq_number,
        };
        let addr = head_md_physical_addr(band, geo);
        let packed = pad_to_blocks(head.pack(), geo.block_size, geo.head_md_blocks);
        base.write_blocks(addr, &packed).map_err(|_| FtlError::Io)
    }
}

/// Pads a packed metadata record out to `num_blocks * block_size` bytes
/// (zero-filled beyond the record itself) so it satisfies the device's
/// block-aligned write contract regardless of how small the record is
/// relative to its reserved region.
fn pad_to_blocks(mut buf: Vec<u8>, block_size: usize, num_blocks: u64) -> Vec<u8> {
    let target = block_size * num_blocks as usize;
    assert!(buf.len() <= target, "metadata record does not fit its reserved block region");
    buf.resize(target, 0);
    buf
}

pub fn head_md_physical_addr(band: &Band, geo: &Geometry) -> u64 {
    let first_pu = band.zones.iter().find(|z| z.state != ftl_device_api::ZoneState::Offline).map(|z| z.parallel_unit).unwrap_or(0);
    band.id * geo.blocks_per_band() + first_pu as u64 * geo.zone_size
}

pub fn tail_md_physical_addr(band: &Band, geo: &Geometry) -> u64 {
    let first_pu = band.zones.iter().find(|z| z.state != ftl_device_api::ZoneState::Offline).map(|z| z.parallel_unit).unwrap_or(0);
    band.id * geo.blocks_per_band() + first_pu as u64 * geo.zone_size + (geo.zone_size - geo.tail_md_blocks)
}

pub fn uuid_for_new_band() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2p;
    use uuid::Uuid as TestUuid;

    fn geo() -> Geometry {
        Geometry {
            block_size: 16,
            zone_size: 32,
            num_zones: 4,
            num_parallel_units: 2,
            xfer_size: 4,
            head_md_blocks: 1,
            tail_md_blocks: 1,
        }
    }

    struct MemBase {
        data: std::sync::Mutex<Vec<u8>>,
        bs: usize,
    }

    impl MemBase {
        fn new(geo: &Geometry) -> Self {
            MemBase {
                data: std::sync::Mutex::new(vec![0u8; geo.blocks_per_band() as usize * geo.num_zones as usize * geo.block_size]),
                bs: geo.block_size,
            }
        }
    }

    impl ZonedBlockDevice for MemBase {
        fn block_size(&self) -> usize {
            self.bs
        }
        fn zone_size(&self) -> u64 {
            32
        }
        fn num_zones(&self) -> u64 {
            4
        }
        fn get_zone_info(&self, zone_id: u64) -> Result<ftl_device_api::ZoneInfo, ftl_device_api::IoError> {
            Ok(ftl_device_api::ZoneInfo { zone_id, capacity: 32, write_pointer: zone_id, state: ftl_device_api::ZoneState::Empty })
        }
        fn zone_reset(&self, _zone_id: u64) -> Result<(), ftl_device_api::IoError> {
            Ok(())
        }
        fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), ftl_device_api::IoError> {
            let mut data = self.data.lock().unwrap();
            let start = lba as usize * self.bs;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }
        fn writev_blocks(&self, lba: u64, iovs: &[&[u8]]) -> Result<(), ftl_device_api::IoError> {
            let mut off = lba;
            for iov in iovs {
                self.write_blocks(off, iov)?;
                off += (iov.len() / self.bs) as u64;
            }
            Ok(())
        }
        fn zone_appendv(&self, _zone_id: u64, _iovs: &[&[u8]]) -> Result<u64, ftl_device_api::IoError> {
            Err(ftl_device_api::IoError::Unsupported)
        }
        fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), ftl_device_api::IoError> {
            let data = self.data.lock().unwrap();
            let start = lba as usize * self.bs;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(())
        }
        fn drain_media_events(&self, _visit: &mut dyn FnMut(ftl_device_api::MediaEvent)) {}
    }

    fn opened_band(id: u64, geo: &Geometry) -> Band {
        let mut band = Band::new(id, geo, TestUuid::from_u128(id as u128 + 1));
        band.begin_erase();
        band.begin_open(geo);
        band.confirm_open();
        band
    }

    #[test]
    fn full_band_closes_and_records_lba_map() {
        let geo = geo();
        let mut bands = vec![opened_band(0, &geo), opened_band(1, &geo)];
        let l2p = L2pTable::new(usable(&geo));
        let wb = WriteBuffer::new(1, 8, geo.block_size, geo.xfer_size as usize);
        let base = MemBase::new(&geo);
        let mut wptr = WritePointer::new(0);

        let usable_blocks = bands[0].usable_blocks(&geo);
        for lba in 0..usable_blocks {
            let entry = wb.channels[0].acquire(&l2p, EntryFlags::empty()).unwrap();
            wb.channels[0].fill(&entry, lba, &vec![(lba % 251) as u8; geo.block_size], None);
            l2p::install(&l2p, &bands, &geo, lba, entry.addr());
            wb.channels[0].push_submit(entry.index);
        }

        let mut closed = false;
        for _ in 0..200 {
            let progress = wptr.process_writes(&mut bands, &geo, &wb, &l2p, &base, false).unwrap();
            if progress.band_closed {
                closed = true;
                break;
            }
        }
        assert!(closed, "band should have closed after exactly usable_blocks writes");
        assert_eq!(bands[0].state, BandState::Closed);
        let md = bands[0].md.lock();
        assert_eq!(md.num_valid, usable_blocks as usize);
        for lba in 0..usable_blocks {
            let off = bands[0].block_offset_from_address(&geo, l2p.get(lba)).unwrap();
            assert_eq!(md.lba_map[off as usize], lba);
        }
    }

    #[test]
    fn relocated_write_tracks_source_dependency_until_destination_closes() {
        let geo = geo();
        let mut bands = vec![opened_band(0, &geo), opened_band(1, &geo)];
        bands[0].state = BandState::Closed; // pretend band 0 is the closed relocation source
        let l2p = L2pTable::new(usable(&geo));
        let wb = WriteBuffer::new(1, 8, geo.block_size, geo.xfer_size as usize);
        let base = MemBase::new(&geo);
        let mut wptr = WritePointer::new(1);

        let entry = wb.channels[0].acquire(&l2p, EntryFlags::INTERNAL | EntryFlags::WEAK).unwrap();
        wb.channels[0].fill(&entry, 7, &vec![9u8; geo.block_size], Some(0));
        l2p.set(7, entry.addr());
        wb.channels[0].push_submit(entry.index);

        let progress = wptr.process_writes(&mut bands, &geo, &wb, &l2p, &base, false).unwrap();
        assert!(progress.busy);
        assert_eq!(bands[1].reloc_bitmap.len(), 1);
        assert_eq!(bands[0].num_reloc_bands, 1);
    }

    fn usable(geo: &Geometry) -> u64 {
        geo.usable_blocks_per_band()
    }
}
