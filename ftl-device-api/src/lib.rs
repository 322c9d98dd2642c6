#![no_std]

//! Contracts for the two device kinds the FTL core consumes: a zoned base
//! device and an optional byte-addressable cache device. Drivers (virtio-blk,
//! NVMe zoned namespaces, ...) live outside this crate; the FTL only ever
//! talks to these traits.

pub type Lba = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The caller supplied invalid parameters (e.g., zero length, wrong units).
    InvalidParam,
    /// The request exceeds device capacity or addresses an invalid LBA.
    OutOfRange,
    /// The buffer size or address does not meet device alignment constraints.
    Align,
    /// The device/controller cannot accept more requests at the moment.
    Busy,
    /// The operation did not complete within the expected time.
    Timeout,
    /// The device or transport reported a hardware error.
    Device,
    /// The target media or device is read-only.
    ReadOnly,
    /// The requested operation is not supported by this device.
    Unsupported,
    /// The system could not allocate required resources (e.g., bounce buffers).
    NoMemory,
    /// A generic I/O failure not covered by other variants.
    Io,
    /// The device/transport violated the expected protocol.
    Protocol,
    /// The device isn't ready (e.g., uninitialized).
    NotReady,
    /// Internal queues/data structures are corrupted or inconsistent.
    Corrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Empty,
    Open,
    Full,
    Closed,
    ReadOnly,
    Offline,
}

/// Mirrors a single zone of the base device. `zone_id` is the zone's first
/// block offset, which doubles as its index since zones are fixed-size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub zone_id: Lba,
    pub capacity: u64,
    pub write_pointer: Lba,
    pub state: ZoneState,
}

/// An asynchronous media-error notification (e.g. a failing block range that
/// must be evacuated before it is lost).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaEvent {
    pub zone_id: Lba,
    pub num_blocks: u64,
}

/// The base device: write-once-per-offset-until-reset zones, striped across
/// parallel units. All methods are synchronous from the caller's point of
/// view; implementations may still be backed by asynchronous hardware.
pub trait ZonedBlockDevice: Send + Sync {
    /// Logical block size in bytes. Must be a power of two.
    fn block_size(&self) -> usize;

    /// Number of blocks per zone.
    fn zone_size(&self) -> u64;

    /// Number of zones on the device.
    fn num_zones(&self) -> u64;

    fn num_blocks(&self) -> u64 {
        self.zone_size() * self.num_zones()
    }

    /// Reads back the current state of a zone.
    fn get_zone_info(&self, zone_id: Lba) -> Result<ZoneInfo, IoError>;

    /// Requests that a zone be reset. Must not return `Ok` until the zone
    /// is usable again (`state == Empty`, `write_pointer == zone_id`).
    fn zone_reset(&self, zone_id: Lba) -> Result<(), IoError>;

    /// Writes `buf` starting at `lba`. `buf.len()` must be a multiple of
    /// `block_size()`. The range must land at the zone's current write
    /// pointer; violating sequential-write order is `IoError::InvalidParam`.
    fn write_blocks(&self, lba: Lba, buf: &[u8]) -> Result<(), IoError>;

    /// Vectored form of `write_blocks`.
    fn writev_blocks(&self, lba: Lba, iovs: &[&[u8]]) -> Result<(), IoError>;

    /// Appends `iovs` to `zone_id` at whatever its current write pointer is
    /// and returns the block offset the data landed at. Only available when
    /// `supports_append()` is true.
    fn zone_appendv(&self, zone_id: Lba, iovs: &[&[u8]]) -> Result<Lba, IoError>;

    fn read_blocks(&self, lba: Lba, buf: &mut [u8]) -> Result<(), IoError>;

    /// Invokes `visit` once per pending media event and clears the queue.
    /// Avoids an allocator dependency at the trait boundary.
    fn drain_media_events(&self, visit: &mut dyn FnMut(MediaEvent));

    /// True if `zone_appendv` can be used in place of `writev_blocks` plus
    /// caller-tracked write pointers.
    fn supports_append(&self) -> bool {
        false
    }
}

/// The optional NV-cache device: byte/block-addressable, supports an
/// out-of-band per-block metadata region alongside data.
pub trait CacheBlockDevice: Send + Sync {
    fn get_block_size(&self) -> usize;

    /// Size of the per-block metadata region, in bytes. Must be >= 8 and is
    /// stored separately from the data payload.
    fn get_md_size(&self) -> usize;

    fn get_num_blocks(&self) -> u64;

    fn write_blocks_with_md(&self, lba: Lba, data: &[u8], md: &[u8]) -> Result<(), IoError>;

    fn writev_blocks_with_md(
        &self,
        lba: Lba,
        iovs: &[&[u8]],
        md: &[&[u8]],
    ) -> Result<(), IoError>;

    fn write_zeroes_blocks(&self, lba: Lba, num_blocks: u64) -> Result<(), IoError>;

    fn read_blocks_with_md(
        &self,
        lba: Lba,
        data: &mut [u8],
        md: &mut [u8],
    ) -> Result<(), IoError>;
}
