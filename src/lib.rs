//! HN4 core: address arithmetic, the Spatial Router, the Cortex metadata
//! table, the Signet provenance chain, and the Auto-Medic repair path.
//!
//! This crate implements the interlocked subsystems a block-oriented
//! storage engine needs to turn a logical volume LBA+op into durable,
//! corruption-resistant device I/O. It does not implement a HAL, a block
//! allocator, mount/unmount, or any CLI surface — those are a higher
//! layer's job; see [`hal`] and [`alloc`] for the trait boundaries this
//! crate consumes.

pub mod addr;
pub mod alloc;
pub mod automedic;
pub mod cortex;
pub mod endian;
pub mod error;
pub mod hal;
pub mod ids;
pub mod names;
pub mod qmask;
pub mod resonance;
pub mod router;
pub mod signet;
pub mod uri;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;
