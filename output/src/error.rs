use std::fmt::Display;
use thiserror::Error;

/// Errors reported by output modes.
///
/// `Unsupported` is the answer to a control request a backend does not
/// implement; callers treat it as "not here", never as a fatal condition.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output is not open")]
    NotOpen,

    #[error("request not supported by this output")]
    Unsupported,

    #[error("no usable sample format: {0}")]
    Format(String),

    #[error("{0}")]
    Device(String),

    #[error("{0}")]
    Encoder(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl OutputError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// A device, driver or server that refused to start playback.
pub fn open_failed(backend: &str, target: &str, err: impl Display) -> String {
    format!("{backend}: cannot open {target}: {err}")
}

/// A step of a running stream (write, drain, send) that failed.
pub fn op_failed(backend: &str, op: &str, err: impl Display) -> String {
    format!("{backend}: {op} failed: {err}")
}

pub fn encoder_error(encoder: &str, path: &str, err: impl Display) -> String {
    format!("{encoder} encoder error on '{path}': {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_device_and_cause() {
        let msg = open_failed("ALSA", "'hw:0,0'", "Device or resource busy");
        assert_eq!(msg, "ALSA: cannot open 'hw:0,0': Device or resource busy");

        let msg = op_failed("waveOut", "waveOutWrite", "MMSYSERR_NOMEM");
        assert_eq!(msg, "waveOut: waveOutWrite failed: MMSYSERR_NOMEM");
    }

    #[test]
    fn io_error_keeps_context() {
        let err = OutputError::io(
            "out.aiff",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "out.aiff: denied");
        assert!(!err.is_unsupported());
        assert!(OutputError::Unsupported.is_unsupported());
    }
}
