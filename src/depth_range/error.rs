use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergerError {
    #[error("range device failed to connect")]
    DeviceFailed,

    #[error("timed out after {0} ms waiting for a range device")]
    DeviceTimeout(u64),

    #[error("range device reports no enabled streams")]
    NoStreams,

    #[error("depth and video stream dimensions disagree: {0}x{1} vs {2}x{3}")]
    StreamMismatch(usize, usize, usize, usize),

    #[error("range device dimensions {0}x{1} do not match the merged canvas {2}x{3}")]
    CanvasMismatch(usize, usize, usize, usize),
}

pub type Result<T> = std::result::Result<T, MergerError>;
