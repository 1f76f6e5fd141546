use std::fmt;

/// Errors raised by the program-partition writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    NoUpdatePartition,
    RegionBusy,
    InsufficientSpace { requested: usize, capacity: usize },
    BeginFailed(String),
    WriteFailed(String),
    ValidationFailed(String),
    BootPartitionFailed(String),
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::NoUpdatePartition => write!(f, "no update partition available"),
            FlashError::RegionBusy => write!(f, "an update region is already open"),
            FlashError::InsufficientSpace { requested, capacity } => write!(
                f,
                "not enough space for update ({requested} bytes requested, {capacity} available)"
            ),
            FlashError::BeginFailed(e) => write!(f, "update begin failed: {e}"),
            FlashError::WriteFailed(e) => write!(f, "update write failed: {e}"),
            FlashError::ValidationFailed(e) => write!(f, "image validation failed: {e}"),
            FlashError::BootPartitionFailed(e) => write!(f, "setting boot partition failed: {e}"),
        }
    }
}

impl std::error::Error for FlashError {}

/// The inactive program partition.
pub trait FirmwareTarget: Send + Sync {
    /// Largest image the inactive partition can hold.
    fn capacity(&self) -> usize;

    /// Opens the single write region. `size` is `None` when the total length
    /// is not known up front (streamed uploads).
    fn begin(&self, size: Option<usize>) -> Result<Box<dyn ImageWriter>, FlashError>;
}

/// An open write region. Dropping it without [`ImageWriter::finalize`]
/// must discard the partial image.
pub trait ImageWriter: Send {
    /// Returns the number of bytes accepted, which may be short on error.
    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError>;

    fn bytes_written(&self) -> usize;

    /// Validates the image and marks it bootable.
    fn finalize(self: Box<Self>) -> Result<(), FlashError>;

    fn abort(self: Box<Self>);
}
