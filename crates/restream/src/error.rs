use thiserror::Error;

use crate::MediaType;

#[derive(Error, Debug)]
pub enum RestreamError {
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("{0} segment {1} is not published yet")]
    SegmentNotReady(MediaType, u64),

    #[error("{media} segment {sequence} left the available window, resumed at {resumed_at}")]
    SegmentGone {
        media: MediaType,
        sequence: u64,
        resumed_at: u64,
    },

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Tracks out of sync: video at {video}, audio at {audio}")]
    Desynchronized { video: u64, audio: u64 },

    #[error("Reader fell behind the retained window")]
    BufferTrimmed,

    #[error("Buffer is closed")]
    BufferClosed,

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel is not running: {0}")]
    ChannelNotRunning(String),

    #[error("No {0} representation found in manifest")]
    NoRepresentationFound(MediaType),

    #[error("Invalid manifest: {0}")]
    ManifestError(String),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

impl RestreamError {
    /// Expected upstream states which are handled inline by the worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RestreamError::SegmentNotReady(..) | RestreamError::SegmentGone { .. }
        )
    }

    /// Whether the edge rejected the credentials of a request.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(
            self,
            RestreamError::HttpError(status)
                if *status == reqwest::StatusCode::UNAUTHORIZED
                    || *status == reqwest::StatusCode::FORBIDDEN
        )
    }
}

pub type RestreamResult<T> = Result<T, RestreamError>;
