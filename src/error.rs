use thiserror::Error;

/// Error kinds surfaced by the mapping core.
///
/// Per-query anomalies (short sequences, empty sketches) are reported as
/// warnings by the pipeline and never terminate a run; everything else here
/// is fatal and propagates to the driver.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index format error: {0}")]
    IndexFormat(String),

    #[error("sequence of {len} bp is shorter than k = {k}")]
    InputTooShort { len: usize, k: usize },
}

pub type Result<T> = std::result::Result<T, MapError>;
