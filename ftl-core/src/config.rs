//! Device geometry and the user-facing configuration object (§6.1).

use bitflags::bitflags;

bitflags! {
    /// FTL startup mode mask (`spdk_ftl_mode` equivalent).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u32 {
        /// Create a new device instead of restoring from disk.
        const CREATE = 1 << 0;
    }
}

/// Fixed facts about the underlying devices, established at `create` time
/// and never changed for the life of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub zone_size: u64,
    pub num_zones: u64,
    pub num_parallel_units: u32,
    pub xfer_size: u64,
    pub head_md_blocks: u64,
    pub tail_md_blocks: u64,
}

impl Geometry {
    pub fn blocks_per_band(&self) -> u64 {
        self.zone_size * self.num_parallel_units as u64
    }

    pub fn usable_blocks_per_band(&self) -> u64 {
        self.blocks_per_band() - (self.head_md_blocks + self.tail_md_blocks) * self.num_parallel_units as u64
    }

    pub fn num_bands(&self) -> u64 {
        self.num_zones
    }
}

/// One back-pressure level (§4.11): below `free_band_threshold` bands free,
/// user I/O is capped to `user_io_percent_allowed` percent of `qdepth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureLimit {
    pub free_band_threshold: u64,
    pub user_io_percent_allowed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureLimits {
    pub crit: BackpressureLimit,
    pub high: BackpressureLimit,
    pub low: BackpressureLimit,
    pub start: BackpressureLimit,
}

impl Default for BackpressureLimits {
    fn default() -> Self {
        // Ordered CRIT < HIGH < LOW < START per §4.11.
        BackpressureLimits {
            crit: BackpressureLimit { free_band_threshold: 1, user_io_percent_allowed: 5 },
            high: BackpressureLimit { free_band_threshold: 2, user_io_percent_allowed: 20 },
            low: BackpressureLimit { free_band_threshold: 3, user_io_percent_allowed: 50 },
            start: BackpressureLimit { free_band_threshold: 4, user_io_percent_allowed: 100 },
        }
    }
}

/// `nv_cache.{max_request_cnt, max_request_size}` (§6.1): NV-cache
/// concurrency and max I/O span.
#[derive(Debug, Clone)]
pub struct NvCacheConf {
    pub max_request_cnt: u32,
    pub max_request_size: usize,
}

impl Default for NvCacheConf {
    fn default() -> Self {
        NvCacheConf { max_request_cnt: 2048, max_request_size: 1 << 20 }
    }
}

/// `opts.conf` (§6.1): the recognized configuration keys and their effects.
#[derive(Debug, Clone)]
pub struct FtlConf {
    /// Percentage of blocks withheld from `num_lbas`, `0 < v < 100`.
    pub reserve_pct: u32,
    /// Per-channel write buffer capacity, in bytes; must be a multiple of block size.
    pub write_buffer_size: usize,
    pub user_io_pool_size: usize,
    /// Rounded up to the next power of two by `FtlDevice::create`.
    pub max_io_channels: u32,
    pub max_reloc_qdepth: u32,
    pub max_active_relocs: u32,
    pub limits: BackpressureLimits,
    pub invalid_threshold_pct: u32,
    pub band_threshold_pct: u32,
    /// On dirty restart, accept (`true`) or reject bands that never reached CLOSED.
    pub allow_open_bands: bool,
    pub l2p_path: Option<String>,
    pub nv_cache: NvCacheConf,
    pub mode: Mode,
}

impl Default for FtlConf {
    fn default() -> Self {
        FtlConf {
            reserve_pct: 6,
            write_buffer_size: 1 << 20,
            user_io_pool_size: 256,
            max_io_channels: 16,
            max_reloc_qdepth: 16,
            max_active_relocs: 4,
            limits: BackpressureLimits::default(),
            invalid_threshold_pct: 30,
            band_threshold_pct: 80,
            allow_open_bands: false,
            l2p_path: None,
            nv_cache: NvCacheConf::default(),
            mode: Mode::CREATE,
        }
    }
}

impl FtlConf {
    /// `block_size` comes from the base device, not from this config
    /// object, so it's taken as a parameter rather than a field (§6.1
    /// `write_buffer_size`: "must be a multiple of block size").
    pub fn validate(&self, block_size: usize) -> Result<(), &'static str> {
        if self.reserve_pct == 0 || self.reserve_pct >= 100 {
            return Err("reserve_pct must satisfy 0 < v < 100");
        }
        if self.write_buffer_size == 0 {
            return Err("write_buffer_size must be non-zero");
        }
        if self.write_buffer_size % block_size != 0 {
            return Err("write_buffer_size must be a multiple of block size");
        }
        Ok(())
    }

    pub fn max_io_channels_rounded(&self) -> u32 {
        self.max_io_channels.next_power_of_two()
    }
}
