//! M3U playlist loader.
//!
//! ```text
//! #EXTM3U
//! #EXTINF:-1 tvg-id="001" edge-url="https://edge/tok/bpk-tv/001/tve/index.mpd",First
//! https://cdn.example.com/bpk-tv/001/tve/index.mpd
//! ```
//!
//! The channel id is taken from `tvg-id`, or from the path segment following
//! `bpk-tv`. HLS entries are skipped.
use std::{collections::HashSet, path::Path, sync::LazyLock};

use regex::Regex;
use restream::ChannelConfig;
use url::Url;

static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).expect("attribute regex is valid")
});

#[derive(Debug, Default)]
struct ExtInf {
    name: String,
    tvg_id: Option<String>,
    edge_url: Option<String>,
}

impl ExtInf {
    fn parse(line: &str) -> Self {
        let info = line.trim_start_matches("#EXTINF:");

        // the display name follows the first comma outside of quotes
        let mut quoted = false;
        let split = info.char_indices().find_map(|(i, c)| match c {
            '"' => {
                quoted = !quoted;
                None
            }
            ',' if !quoted => Some(i),
            _ => None,
        });
        let (attributes, name) = match split {
            Some(i) => (&info[..i], info[i + 1..].trim()),
            None => (info, ""),
        };

        let mut result = Self {
            name: name.to_string(),
            ..Default::default()
        };
        for caps in ATTRIBUTE_REGEX.captures_iter(attributes) {
            let value = caps[2].trim().to_string();
            if value.is_empty() {
                continue;
            }
            match &caps[1] {
                "tvg-id" => result.tvg_id = Some(value),
                "edge-url" => result.edge_url = Some(value),
                _ => {}
            }
        }
        result
    }
}

fn channel_id_from_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "bpk-tv")?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Parse a playlist into channel configurations, in playlist order.
pub fn parse(text: &str) -> Vec<ChannelConfig> {
    let mut channels = Vec::new();
    let mut seen = HashSet::new();
    let mut info = ExtInf::default();

    for line in text.lines().map(str::trim) {
        if line.starts_with("#EXTINF:") {
            info = ExtInf::parse(line);
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let current = std::mem::take(&mut info);
        let url = match Url::parse(line) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                tracing::warn!(line, "Skipping playlist entry with invalid URL");
                continue;
            }
        };
        if url.path().ends_with(".m3u8") {
            tracing::debug!(%url, "Skipping HLS channel");
            continue;
        }

        let Some(id) = current.tvg_id.or_else(|| channel_id_from_url(&url)) else {
            tracing::warn!(%url, "Skipping playlist entry without channel id");
            continue;
        };
        if !seen.insert(id.clone()) {
            tracing::warn!(channel = %id, "Duplicate channel in playlist, keeping the first");
            continue;
        }

        let mut channel = ChannelConfig::new(id, url);
        if !current.name.is_empty() {
            channel = channel.with_name(current.name);
        }
        if let Some(edge) = current.edge_url {
            match Url::parse(&edge) {
                Ok(edge) => channel = channel.with_initial_edge(edge),
                Err(e) => tracing::warn!(channel = %channel.id, "Ignoring invalid edge-url: {e}"),
            }
        }
        channels.push(channel);
    }

    channels
}

pub async fn load(path: &Path) -> anyhow::Result<Vec<ChannelConfig>> {
    let text = tokio::fs::read_to_string(path).await?;
    let channels = parse(&text);
    tracing::info!(path = %path.display(), channels = channels.len(), "Playlist loaded");
    Ok(channels)
}
