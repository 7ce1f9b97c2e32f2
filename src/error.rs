use thiserror::Error;

/// Failures surfaced by the detector.
///
/// Everything that merely degrades accuracy (missing counters, missing cache
/// instructions, a coarse clock) is logged and absorbed. Only conditions that
/// make a measurement impossible come back as `Err`.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// A scratch buffer could not be allocated; the host cannot run this measurement.
    #[error("measurement unavailable: could not allocate {bytes} bytes for {what}")]
    MeasurementUnavailable { what: &'static str, bytes: usize },

    /// Fewer than two counters are open, so a snapshot would be meaningless.
    #[error("performance counters unavailable ({open} of 8 open)")]
    CountersUnavailable { open: usize },

    #[error("failed to read {counter} counter: {source}")]
    CounterRead {
        counter: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DetectorError>;

/// Allocates a zero-initialised scratch buffer, reporting allocation failure
/// instead of aborting the process.
pub(crate) fn scratch_buffer(what: &'static str, bytes: usize, fill: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|_| DetectorError::MeasurementUnavailable { what, bytes })?;
    buf.resize(bytes, fill);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_buffer_is_filled() {
        let buf = scratch_buffer("test", 4096, 0x5A).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn impossible_allocation_is_measurement_unavailable() {
        let err = scratch_buffer("huge", usize::MAX, 0).unwrap_err();
        match err {
            DetectorError::MeasurementUnavailable { what, bytes } => {
                assert_eq!(what, "huge");
                assert_eq!(bytes, usize::MAX);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
