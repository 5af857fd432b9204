//! The block allocator surface consumed by write paths.
//! Concrete allocation/free bookkeeping is out of scope for this crate;
//! only the trait boundary lives here, mirroring [`crate::hal::Hal`].

use crate::error::HnResult;
use crate::volume::Volume;

/// Allocates and frees Horizon-region blocks for a volume.
pub trait Allocator: Send + Sync {
    /// Allocate one FS block from the Horizon region, returning its LBA.
    fn alloc_horizon(&self, vol: &Volume) -> HnResult<u64>;

    /// Return a previously allocated block to the free pool.
    fn free_block(&self, vol: &Volume, lba: u64) -> HnResult<()>;
}
