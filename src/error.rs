use thiserror::Error;

/// Pipeline error taxonomy. Transient input and protocol errors are
/// logged and dropped at the stage that observes them; resource errors
/// are fatal at startup and fatal-logged during a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame shape {actual_rows}x{actual_cols} does not match geometry {rows}x{cols}")]
    ShapeMismatch {
        rows: u32,
        cols: u32,
        actual_rows: u32,
        actual_cols: u32,
    },

    #[error("unknown scan_index {0}")]
    UnknownScanIndex(i64),

    #[error("malformed frame metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("payload of {actual} bytes, expected {expected}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("FFT plan construction failed: {0}")]
    FftPlan(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("frame transport closed")]
    TransportClosed,
}

impl Error {
    /// Whether the pipeline can continue with degraded output after
    /// logging this error. Structural failures (GPU, FFT plans) cannot
    /// be recovered from.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::FftPlan(_) | Error::Gpu(_) | Error::Config(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_errors_are_fatal() {
        assert!(!Error::FftPlan("zero-width detector".into()).is_transient());
        assert!(!Error::Gpu("no adapter".into()).is_transient());
        assert!(
            Error::ShapeMismatch {
                rows: 4,
                cols: 5,
                actual_rows: 10,
                actual_cols: 10
            }
            .is_transient()
        );
        assert!(Error::UnknownScanIndex(7).is_transient());
    }
}
