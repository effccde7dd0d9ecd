//! TUN device abstraction.
//!
//! The VNet core does not open or configure the OS interface itself; it
//! drives any device that satisfies [`TunDevice`]. Batching mirrors what the
//! common TUN backends expose, so a single adapter call can move several L3
//! frames.

use crate::error::VnetResult;
use async_trait::async_trait;

/// Bytes reserved at the front of every packet buffer handed to the device.
///
/// Batching TUN backends expect room for a transport header before the frame
/// itself; reads and writes pass this value as their buffer offset.
pub const HEADER_RESERVE: usize = 16;

/// A virtual network TUN device carrying raw L3 frames.
///
/// The manager owns the device from construction and guarantees it is closed
/// exactly once at teardown.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one or more packets from the device (without any additional
    /// headers). On success, returns the number of packets read and sets the
    /// packet lengths within `sizes`. `sizes.len()` must be >=
    /// `bufs.len()`. A nonzero `offset` instructs the device where to begin
    /// reading into each element of `bufs`.
    async fn read(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> VnetResult<usize>;

    /// Write one or more packets to the device (without any additional
    /// headers). On success, returns the number of packets written. A nonzero
    /// `offset` instructs the device where each packet begins within the
    /// elements of `bufs`.
    async fn write(&self, bufs: &mut [Vec<u8>], offset: usize) -> VnetResult<usize>;

    /// Preferred/max number of packets that can be moved in a single read or
    /// write call. Must not change over the lifetime of the device.
    fn batch_size(&self) -> usize;

    /// Release the OS resources behind the device. Idempotent; any
    /// in-progress read or write is unblocked with an I/O error.
    async fn close(&self) -> VnetResult<()>;
}
