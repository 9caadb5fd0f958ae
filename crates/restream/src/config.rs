use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// Static description of one channel, supplied by the playlist loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,

    /// CDN entry point of the manifest. It answers with a redirect to an edge node
    /// carrying a short-lived token.
    pub manifest_url: Url,

    /// Already issued edge URL of the manifest, used until the first refresh is due.
    #[serde(default)]
    pub initial_edge: Option<Url>,

    /// Upper bound of the video representation bandwidth. Falls back to
    /// [EngineConfig::video_bandwidth].
    #[serde(default)]
    pub video_bandwidth: Option<u64>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, manifest_url: Url) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            manifest_url,
            initial_edge: None,
            video_bandwidth: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_initial_edge(mut self, edge: Url) -> Self {
        self.initial_edge = Some(edge);
        self
    }

    pub fn with_video_bandwidth(mut self, bandwidth: u64) -> Self {
        self.video_bandwidth = Some(bandwidth);
        self
    }
}

/// Operational tuning shared by every channel.
///
/// Durations are written as seconds (fractions allowed) in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of an edge token after it was issued.
    #[serde(deserialize_with = "secs_f64")]
    pub token_validity: Duration,
    /// Refresh the token once its remaining validity drops below this margin.
    #[serde(deserialize_with = "secs_f64")]
    pub token_safety_margin: Duration,
    /// Timeout of every upstream request.
    #[serde(deserialize_with = "secs_f64")]
    pub request_timeout: Duration,

    /// Hard failures tolerated within `failure_window` before a channel enters Error.
    pub retry_budget: u32,
    #[serde(deserialize_with = "secs_f64")]
    pub failure_window: Duration,
    #[serde(deserialize_with = "secs_f64")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "secs_f64")]
    pub backoff_ceiling: Duration,

    /// Delay before asking again for a segment which is not published yet.
    #[serde(deserialize_with = "secs_f64")]
    pub not_ready_delay: Duration,
    /// Consecutive not-ready answers after which the upstream is considered stalled.
    pub not_ready_limit: u32,
    /// Minimum interval between two manifest reloads.
    #[serde(deserialize_with = "secs_f64")]
    pub manifest_refresh_interval: Duration,
    pub manifest_name: String,

    /// Segments at the end of the timeline which are not requested yet.
    pub live_edge_holdback: u64,
    /// How many segments behind the live edge a channel starts.
    pub start_offset: u64,
    /// Maximum lead of one track over the other, in segments.
    pub desync_tolerance: u64,

    pub retention_chunks: usize,
    pub retention_bytes: usize,

    /// Time given to a fetch task to wind down after cancellation.
    #[serde(deserialize_with = "secs_f64")]
    pub stop_timeout: Duration,

    pub video_bandwidth: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_validity: Duration::from_secs(80),
            token_safety_margin: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            retry_budget: 3,
            failure_window: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(30),
            not_ready_delay: Duration::from_secs(1),
            not_ready_limit: 30,
            manifest_refresh_interval: Duration::from_secs(2),
            manifest_name: "index.mpd".to_string(),
            live_edge_holdback: 2,
            start_offset: 5,
            desync_tolerance: 2,
            retention_chunks: 30,
            retention_bytes: 64 * 1024 * 1024,
            stop_timeout: Duration::from_secs(5),
            video_bandwidth: 1_087_600,
        }
    }
}

fn secs_f64<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
