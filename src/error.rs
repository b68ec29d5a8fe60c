use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("another backfill holds the campaign lock at {0}")]
    CampaignLocked(String),
    #[error("checkpoint rejected: {0}")]
    InvalidCheckpoint(String),
    #[error("unsupported remote backend: {0}")]
    UnsupportedBackend(String),
}

impl VaultError {
    pub fn code(&self) -> VaultErrorCode {
        match self {
            Self::InvalidConfig(_) => VaultErrorCode::E005ConfigInvalid,
            Self::CampaignLocked(_) => VaultErrorCode::E001Locked,
            Self::InvalidCheckpoint(_) => VaultErrorCode::E007CheckpointCorrupt,
            Self::UnsupportedBackend(_) => VaultErrorCode::E004BackendInvalid,
        }
    }
}

/// Unrecoverable failure of one fetch task. The scheduler logs it and moves on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch for {date} failed: {message}")]
    Failed { date: String, message: String },
    #[error("fetch for {date} could not read {path}: {source}")]
    Io {
        date: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultErrorCode {
    E001Locked,
    E004BackendInvalid,
    E005ConfigInvalid,
    E007CheckpointCorrupt,
}

impl VaultErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Locked => "E001_LOCKED",
            Self::E004BackendInvalid => "E004_BACKEND_INVALID",
            Self::E005ConfigInvalid => "E005_CONFIG_INVALID",
            Self::E007CheckpointCorrupt => "E007_CHECKPOINT_CORRUPT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_map_to_locked_code() {
        let err = VaultError::CampaignLocked("/tmp/x.lock".into());
        assert_eq!(err.code().as_str(), "E001_LOCKED");
        assert!(err.to_string().contains("/tmp/x.lock"));
    }
}
