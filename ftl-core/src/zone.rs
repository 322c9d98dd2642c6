//! Zone bookkeeping (§4.2): the FTL's mirror of externally-owned zone state,
//! plus the transient `busy` flag used when the device has no atomic append.

pub use ftl_device_api::ZoneState;

#[derive(Debug, Clone)]
pub struct Zone {
    /// First block offset of the zone on the base device; also its index
    /// within the owning band's parallel-unit ordering.
    pub zone_id: u64,
    pub parallel_unit: u32,
    pub capacity: u64,
    pub write_pointer: u64,
    pub state: ZoneState,
    /// Set while an outstanding write targets this zone; only consulted
    /// when the device does not support atomic append.
    pub busy: bool,
}

impl Zone {
    pub fn new(zone_id: u64, parallel_unit: u32, capacity: u64) -> Self {
        Zone {
            zone_id,
            parallel_unit,
            capacity,
            write_pointer: zone_id,
            state: ZoneState::Empty,
            busy: false,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.state, ZoneState::Empty | ZoneState::Open) && !self.busy
    }

    /// Advances the write pointer after a successful `xfer_size` write,
    /// transitioning to `Full` once capacity is exhausted.
    pub fn advance(&mut self, xfer_size: u64) {
        self.write_pointer += xfer_size;
        self.state = ZoneState::Open;
        if self.write_pointer >= self.zone_id + self.capacity {
            self.state = ZoneState::Full;
        }
    }

    pub fn begin_reset(&mut self) {
        // state stays until the reset I/O completes
    }

    pub fn complete_reset(&mut self) {
        self.state = ZoneState::Empty;
        self.write_pointer = self.zone_id;
        self.busy = false;
    }

    pub fn mark_offline(&mut self) {
        self.state = ZoneState::Offline;
    }
}
