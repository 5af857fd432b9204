use thiserror::Error;

/// The HN4 error taxonomy.
///
/// Success is never a variant of this type: routines that can also report
/// `INFO_SPARSE`/`INFO_HEALED` return those through their own `Ok(..)`
/// payload (see [`crate::router::RouteOutcome`]) rather than through an
/// overloaded status code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HnError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("geometry out of range")]
    Geometry,
    #[error("alignment failure")]
    AlignmentFail,
    #[error("allocation failure")]
    NoMem,
    #[error("device I/O error")]
    HwIo,
    #[error("checksum or read-back verification failed")]
    DataRot,
    #[error("media permanently poisoned")]
    MediaToxic,
    #[error("compare-and-swap starved past its retry cap")]
    AtomicsTimeout,
    #[error("parity reconstruction double fault")]
    ParityBroken,
    #[error("operation not permitted for this device profile")]
    ProfileMismatch,
    #[error("access denied")]
    AccessDenied,
    #[error("entry not found")]
    NotFound,
    #[error("entry is tombstoned")]
    Tombstone,
    #[error("allocation target is a phantom block")]
    PhantomBlock,
    #[error("allocation space has collapsed")]
    GravityCollapse,
    #[error("chain topology has been tampered with")]
    Tampered,
    #[error("time paradox: anchor history postdates the requested slice")]
    TimeParadox,
    #[error("protocol version incompatible")]
    VersionIncompat,
    #[error("id mismatch")]
    IdMismatch,
    #[error("allocation bitmap corrupted beyond repair")]
    BitmapCorrupt,
    #[error("anchor generation does not match what was persisted")]
    GenerationSkew,
}

/// Result alias used throughout the crate.
pub type HnResult<T> = Result<T, HnError>;
