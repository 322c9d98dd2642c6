//! Persistent band metadata (§4.4, §6.3): fixed-layout records with an
//! explicit CRC32C trailer, replacing the packed-struct-over-union approach
//! of the original metadata macros.
//!
//! Endianness is host-native (§6.3): the layout is not meant to be portable
//! across hosts, only stable across a restart of the same machine.

use crate::error::MetadataRejectReason;
use uuid::Uuid;

const MAGIC: u32 = 0x4654_4C31; // "FTL1"
const VERSION: u16 = 1;

/// Head metadata: written once, at `OPENING -> OPEN`, block-size aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadMetadata {
    pub uuid: Uuid,
    pub band_id: u64,
    pub write_count: u64,
    pub seq_number: u64,
}

impl HeadMetadata {
    const FIXED_LEN: usize = 4 + 2 + 16 + 8 + 8 + 8 + 4; // magic,version,uuid,band_id,write_count,seq,crc

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_LEN);
        buf.extend_from_slice(&MAGIC.to_ne_bytes());
        buf.extend_from_slice(&VERSION.to_ne_bytes());
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.extend_from_slice(&self.band_id.to_ne_bytes());
        buf.extend_from_slice(&self.write_count.to_ne_bytes());
        buf.extend_from_slice(&self.seq_number.to_ne_bytes());
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_ne_bytes());
        buf
    }

    pub fn unpack(buf: &[u8], expect_uuid: Option<Uuid>) -> Result<Self, MetadataRejectReason> {
        if buf.len() < Self::FIXED_LEN {
            return Err(MetadataRejectReason::InvalidSize);
        }
        let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let crc_span_end = Self::FIXED_LEN - 4;
        let stored_crc = u32::from_ne_bytes(buf[crc_span_end..Self::FIXED_LEN].try_into().unwrap());
        let computed_crc = crc32c::crc32c(&buf[0..crc_span_end]);
        if magic != MAGIC {
            return Err(MetadataRejectReason::NoMetadata);
        }
        if stored_crc != computed_crc {
            return Err(MetadataRejectReason::InvalidCrc);
        }
        let version = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(MetadataRejectReason::InvalidVersion);
        }
        let uuid = Uuid::from_slice(&buf[6..22]).map_err(|_| MetadataRejectReason::NoMetadata)?;
        if let Some(expect) = expect_uuid {
            if uuid != expect {
                return Err(MetadataRejectReason::NoMetadata);
            }
        }
        let band_id = u64::from_ne_bytes(buf[22..30].try_into().unwrap());
        let write_count = u64::from_ne_bytes(buf[30..38].try_into().unwrap());
        let seq_number = u64::from_ne_bytes(buf[38..46].try_into().unwrap());
        Ok(HeadMetadata { uuid, band_id, write_count, seq_number })
    }
}

/// Tail metadata: head fields plus the band's full LBA map and a trailing
/// CRC32C over the whole record (header-minus-checksum prefix and payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailMetadata {
    pub head: HeadMetadata,
    pub lba_map: Vec<u64>,
}

impl TailMetadata {
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(46 + self.lba_map.len() * 8 + 4);
        buf.extend_from_slice(&MAGIC.to_ne_bytes());
        buf.extend_from_slice(&VERSION.to_ne_bytes());
        buf.extend_from_slice(self.head.uuid.as_bytes());
        buf.extend_from_slice(&self.head.band_id.to_ne_bytes());
        buf.extend_from_slice(&self.head.write_count.to_ne_bytes());
        buf.extend_from_slice(&self.head.seq_number.to_ne_bytes());
        for lba in &self.lba_map {
            buf.extend_from_slice(&lba.to_ne_bytes());
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_ne_bytes());
        buf
    }

    pub fn unpack(
        buf: &[u8],
        expect_uuid: Uuid,
        usable_blocks: usize,
    ) -> Result<Self, MetadataRejectReason> {
        let header_len = 46;
        let expected_len = header_len + usable_blocks * 8 + 4;
        if buf.len() != expected_len {
            return Err(MetadataRejectReason::InvalidSize);
        }
        let crc_span_end = expected_len - 4;
        let stored_crc = u32::from_ne_bytes(buf[crc_span_end..expected_len].try_into().unwrap());
        let computed_crc = crc32c::crc32c(&buf[0..crc_span_end]);
        let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(MetadataRejectReason::NoMetadata);
        }
        if stored_crc != computed_crc {
            return Err(MetadataRejectReason::InvalidCrc);
        }
        let version = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(MetadataRejectReason::InvalidVersion);
        }
        let uuid = Uuid::from_slice(&buf[6..22]).map_err(|_| MetadataRejectReason::NoMetadata)?;
        if uuid != expect_uuid {
            return Err(MetadataRejectReason::NoMetadata);
        }
        let band_id = u64::from_ne_bytes(buf[22..30].try_into().unwrap());
        let write_count = u64::from_ne_bytes(buf[30..38].try_into().unwrap());
        let seq_number = u64::from_ne_bytes(buf[38..46].try_into().unwrap());
        let mut lba_map = Vec::with_capacity(usable_blocks);
        for i in 0..usable_blocks {
            let off = header_len + i * 8;
            lba_map.push(u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap()));
        }
        Ok(TailMetadata { head: HeadMetadata { uuid, band_id, write_count, seq_number }, lba_map })
    }

    /// CRC32C that will be stored at close time as `lba_map_checksum`.
    pub fn checksum(&self) -> u32 {
        let packed = self.pack();
        crc32c::crc32c(&packed[..packed.len() - 4])
    }
}

/// NV-cache header, block 0 of the cache device (§4.7, §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvCacheHeader {
    pub uuid: Uuid,
    pub phase: u8,
    pub size: u64,
    /// `Addr::Invalid`-equivalent sentinel on a crash shutdown; otherwise
    /// the exact cursor at the last clean shutdown.
    pub current_addr_at_shutdown: Option<u64>,
}

impl NvCacheHeader {
    pub const LEN: usize = 4 + 2 + 16 + 1 + 8 + 1 + 8 + 4;

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&MAGIC.to_ne_bytes());
        buf.extend_from_slice(&VERSION.to_ne_bytes());
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.push(self.phase);
        buf.extend_from_slice(&self.size.to_ne_bytes());
        match self.current_addr_at_shutdown {
            Some(addr) => {
                buf.push(1);
                buf.extend_from_slice(&addr.to_ne_bytes());
            }
            None => {
                buf.push(0);
                buf.extend_from_slice(&0u64.to_ne_bytes());
            }
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_ne_bytes());
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, MetadataRejectReason> {
        if buf.len() != Self::LEN {
            return Err(MetadataRejectReason::InvalidSize);
        }
        let crc_span_end = Self::LEN - 4;
        let stored_crc = u32::from_ne_bytes(buf[crc_span_end..Self::LEN].try_into().unwrap());
        let computed_crc = crc32c::crc32c(&buf[0..crc_span_end]);
        if stored_crc != computed_crc {
            return Err(MetadataRejectReason::InvalidCrc);
        }
        let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(MetadataRejectReason::NoMetadata);
        }
        let version = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(MetadataRejectReason::InvalidVersion);
        }
        let uuid = Uuid::from_slice(&buf[6..22]).map_err(|_| MetadataRejectReason::NoMetadata)?;
        let phase = buf[22];
        let size = u64::from_ne_bytes(buf[23..31].try_into().unwrap());
        let has_addr = buf[31] != 0;
        let addr_val = u64::from_ne_bytes(buf[32..40].try_into().unwrap());
        Ok(NvCacheHeader {
            uuid,
            phase,
            size,
            current_addr_at_shutdown: if has_addr { Some(addr_val) } else { None },
        })
    }
}

/// Cyclically advances an NV-cache phase through its 3 non-zero values.
pub fn next_phase(phase: u8) -> u8 {
    match phase {
        1 => 2,
        2 => 3,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head() -> HeadMetadata {
        HeadMetadata { uuid: Uuid::from_u128(0xdead_beef), band_id: 3, write_count: 7, seq_number: 42 }
    }

    #[test]
    fn head_round_trip() {
        let md = sample_head();
        let packed = md.pack();
        let unpacked = HeadMetadata::unpack(&packed, Some(md.uuid)).unwrap();
        assert_eq!(unpacked, md);
    }

    #[test]
    fn head_rejects_bit_flip_in_crc_span() {
        let md = sample_head();
        let mut packed = md.pack();
        packed[10] ^= 0xff;
        assert_eq!(HeadMetadata::unpack(&packed, Some(md.uuid)), Err(MetadataRejectReason::InvalidCrc));
    }

    #[test]
    fn head_rejects_uuid_mismatch() {
        let md = sample_head();
        let packed = md.pack();
        let other = Uuid::from_u128(0xcafe_babe);
        assert_eq!(HeadMetadata::unpack(&packed, Some(other)), Err(MetadataRejectReason::NoMetadata));
    }

    #[test]
    fn tail_round_trip() {
        let tail = TailMetadata { head: sample_head(), lba_map: vec![0, 1, crate::address::LBA_INVALID, 3] };
        let packed = tail.pack();
        let unpacked = TailMetadata::unpack(&packed, tail.head.uuid, 4).unwrap();
        assert_eq!(unpacked, tail);
    }

    #[test]
    fn tail_rejects_size_change() {
        let tail = TailMetadata { head: sample_head(), lba_map: vec![0, 1, 2, 3] };
        let packed = tail.pack();
        assert_eq!(
            TailMetadata::unpack(&packed, tail.head.uuid, 5),
            Err(MetadataRejectReason::InvalidSize)
        );
    }

    #[test]
    fn nv_cache_header_round_trip() {
        let hdr = NvCacheHeader { uuid: Uuid::from_u128(1), phase: 2, size: 1024, current_addr_at_shutdown: Some(17) };
        let packed = hdr.pack();
        assert_eq!(NvCacheHeader::unpack(&packed).unwrap(), hdr);
    }

    #[test]
    fn phase_cycles() {
        assert_eq!(next_phase(1), 2);
        assert_eq!(next_phase(2), 3);
        assert_eq!(next_phase(3), 1);
    }
}
