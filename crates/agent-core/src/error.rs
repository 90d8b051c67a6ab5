//! Domain error kinds shared by the agent daemon and the self-upgrader.

use thiserror::Error;

/// Why a download was reported as failed.
#[derive(Debug, Error)]
pub enum DownloadFailureKind {
    #[error("MD5校验失败")]
    Md5Mismatch,
    #[error("接口请求失败")]
    ServerError,
    #[error("{0}")]
    Other(String),
}

impl DownloadFailureKind {
    /// Classify a raw failure message the way the legacy downloader does:
    /// known substrings collapse to a short tag, everything else passes
    /// through verbatim.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains("MD5校验失败") {
            DownloadFailureKind::Md5Mismatch
        } else if message.contains("Internal Server Error") {
            DownloadFailureKind::ServerError
        } else {
            DownloadFailureKind::Other(message)
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("http request failed: {0}")]
    HttpFailure(String),

    #[error("download failed: {0}")]
    DownloadFailure(#[from] DownloadFailureKind),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("entry file not found")]
    EntryNotFound,

    #[error("timed out waiting for process to terminate")]
    ProcessTerminateTimeout,

    #[error("upgrade cancelled")]
    Cancelled,

    #[error("supervisor operation failed: {0}")]
    SupervisorFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_failure_substrings() {
        assert!(matches!(
            DownloadFailureKind::classify("x: MD5校验失败: a vs b"),
            DownloadFailureKind::Md5Mismatch
        ));
        assert!(matches!(
            DownloadFailureKind::classify("500 Internal Server Error"),
            DownloadFailureKind::ServerError
        ));
        assert!(matches!(
            DownloadFailureKind::classify("connection reset"),
            DownloadFailureKind::Other(_)
        ));
    }

    #[test]
    fn cancelled_is_distinguished_from_other_errors() {
        let err = AgentError::Cancelled;
        assert!(matches!(err, AgentError::Cancelled));
    }
}
