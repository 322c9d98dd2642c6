//! Flash Translation Layer core (§1 OVERVIEW): address translation, band
//! management, the write/read paths, relocation and the cooperative
//! reactor that drives them, sitting on top of the synchronous device
//! traits in `ftl-device-api`.
//!
//! `device` is the entry point: `device::FtlDevice::create` brings up a
//! device from a `ZonedBlockDevice` (plus optional `CacheBlockDevice`),
//! and `device::IoChannel` is what user code actually reads and writes
//! through.

mod address;
mod band;
mod bitset;
mod config;
mod device;
mod error;
mod l2p;
mod metadata;
mod nv_cache;
mod reactor;
mod reader;
mod relocator;
mod restore;
mod write_buffer;
mod write_pointer;
mod zone;

pub use address::Addr;
pub use config::{BackpressureLimit, BackpressureLimits, FtlConf, Geometry, Mode, NvCacheConf};
pub use device::{CorePoller, CreateOpts, FtlDevice, IoChannel, Stats};
pub use error::{FtlError, FtlResult, MetadataRejectReason};
pub use reactor::{Event, PollResult, Poller, Reactor, ReactorState};
