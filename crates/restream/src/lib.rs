//! Live DASH restreaming engine.
//!
//! ```text
//! ┌──────────────┐  ensure_fresh   ┌────────────────┐
//! │ TokenSession ◄─────────────────┤ SegmentFetcher │
//! └──────────────┘                 └───────┬────────┘
//!                                          │ next_segment(video / audio)
//!                                  ┌───────▼────────┐
//!                                  │ ChannelWorker  │  Idle → Starting → Live → Error → Stopped
//!                                  └───────┬────────┘
//!                                          │ append
//!                                  ┌───────▼────────┐
//!                                  │   LiveBuffer   │
//!                                  └─┬─────┬──────┬─┘
//!                                    │     │      │ read
//!                             StreamReader ...  StreamReader
//! ```

pub mod buffer;
pub mod config;
pub mod dash;
pub mod error;
pub mod fetcher;
pub mod registry;
pub mod token;
pub mod util;
pub mod worker;

pub use buffer::{LiveBuffer, StreamReader};
pub use config::{ChannelConfig, EngineConfig};
pub use error::{RestreamError, RestreamResult};
pub use fetcher::SegmentFetcher;
pub use registry::{ChannelRegistry, RegistryStats, ReloadSummary, SourceFactory};
pub use token::{EdgeEndpoint, TokenSession};
pub use util::http::HttpClient;
pub use worker::{ChannelState, ChannelStatus, ChannelWorker};

use bytes::Bytes;
use serde::Serialize;

/// A source of segments for one channel. The worker drives it from a single task,
/// so implementations may keep mutable cursor state without locking.
pub trait SegmentSource: Send + 'static {
    /// Acquire credentials, load the manifest and download the initialization
    /// segments. Called before the first segment and after every failure that
    /// requires starting over.
    fn prime(&mut self) -> impl std::future::Future<Output = RestreamResult<Primed>> + Send;

    /// Fetch the next segment of the given media type.
    ///
    /// A failed call must not advance the track: the next call requests the same
    /// segment again.
    fn next_segment(
        &mut self,
        media: MediaType,
    ) -> impl std::future::Future<Output = RestreamResult<Segment>> + Send;
}

/// Initialization data of a primed source.
#[derive(Debug, Clone)]
pub struct Primed {
    /// Video init segment followed by audio init segment.
    pub header: Bytes,
    pub video_representation: String,
    pub audio_representation: String,
    /// The tracks were moved to a new position, so segments fetched before do not
    /// continue into the ones that follow.
    pub resynced: bool,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub media: MediaType,
    pub sequence: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    pub const ALL: [MediaType; 2] = [MediaType::Video, MediaType::Audio];

    pub fn from_content_type(content_type: Option<&str>, mime_type: Option<&str>) -> Option<Self> {
        let kind = content_type.or(mime_type)?;
        if kind.starts_with("video") {
            Some(Self::Video)
        } else if kind.starts_with("audio") {
            Some(Self::Audio)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
