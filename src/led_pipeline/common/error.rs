use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("image is empty")]
    EmptyImage,

    #[error("unexpected image size: expected {expected} bytes, got {actual}")]
    ImageSizeMismatch { expected: usize, actual: usize },

    #[error(
        "not enough data in image: accessing {offset}, len={len}, strand={strand_id}, led={led_id}"
    )]
    ImageDataExhausted {
        offset: usize,
        len: usize,
        strand_id: usize,
        led_id: usize,
    },
}

pub type Result<T> = std::result::Result<T, RenderError>;
