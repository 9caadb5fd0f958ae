use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use tokio::time::Instant;
use url::Url;

use crate::{
    config::{ChannelConfig, EngineConfig},
    dash::{Manifest, TimelineEntry},
    error::{RestreamError, RestreamResult},
    token::TokenSession,
    util::http::HttpClient,
    MediaType, Primed, Segment, SegmentSource,
};

/// Read position of one track.
#[derive(Debug, Default, Clone, Copy)]
struct TrackCursor {
    /// `$Time$` of the next segment. `None` until the first sync.
    next_time: Option<u64>,
    next_sequence: u64,
    /// Segments delivered since the last sync.
    delivered: u64,
}

impl TrackCursor {
    fn at(entry: &TimelineEntry, previous: &TrackCursor) -> Self {
        Self {
            next_time: Some(entry.time),
            // never hand out a sequence number twice
            next_sequence: entry.number.max(previous.next_sequence),
            delivered: 0,
        }
    }
}

enum Location {
    Available { entry: TimelineEntry, next_time: u64 },
    /// Not published yet.
    Ahead,
    /// Dropped from the timeline, or not on a segment boundary.
    Behind,
}

/// Pulls the segments of one channel from its edge node.
///
/// Both tracks are followed by media time, so a manifest reload which shifts
/// `startNumber` does not move the cursors.
pub struct SegmentFetcher {
    channel: String,
    client: HttpClient,
    session: Arc<TokenSession>,

    video_bandwidth: u64,
    manifest_name: String,
    manifest_refresh_interval: Duration,
    live_edge_holdback: u64,
    start_offset: u64,
    desync_tolerance: u64,

    manifest: Option<Manifest>,
    manifest_loaded_at: Option<Instant>,
    /// Set after the edge answered 404: the window may have moved past the cursors.
    window_suspect: bool,
    video: TrackCursor,
    audio: TrackCursor,
}

impl SegmentFetcher {
    pub fn new(
        client: HttpClient,
        channel: &ChannelConfig,
        engine: &EngineConfig,
    ) -> RestreamResult<Self> {
        let mut session = TokenSession::new(
            client.clone(),
            channel.manifest_url.clone(),
            engine.token_validity,
            engine.token_safety_margin,
        );
        if let Some(edge) = &channel.initial_edge {
            session = session.with_initial_edge(edge)?;
        }

        Ok(Self {
            channel: channel.id.clone(),
            client,
            session: Arc::new(session),
            video_bandwidth: channel.video_bandwidth.unwrap_or(engine.video_bandwidth),
            manifest_name: engine.manifest_name.clone(),
            manifest_refresh_interval: engine.manifest_refresh_interval,
            live_edge_holdback: engine.live_edge_holdback,
            start_offset: engine.start_offset,
            desync_tolerance: engine.desync_tolerance,
            manifest: None,
            manifest_loaded_at: None,
            window_suspect: false,
            video: TrackCursor::default(),
            audio: TrackCursor::default(),
        })
    }

    pub fn session(&self) -> &Arc<TokenSession> {
        &self.session
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Sequence number the next segment of `media` will carry.
    pub fn next_sequence(&self, media: MediaType) -> u64 {
        self.cursor(media).next_sequence
    }

    /// Download and parse the manifest from the current edge node.
    pub async fn load_manifest(&mut self) -> RestreamResult<&Manifest> {
        let endpoint = self.session.ensure_fresh().await?;
        let url = endpoint.resolve(&self.manifest_name)?;
        let text = self.get(url).await?.text().await?;
        let manifest = Manifest::parse(&text, self.video_bandwidth)?;

        tracing::debug!(
            channel = %self.channel,
            video = %manifest.video.representation_id,
            audio = %manifest.audio.representation_id,
            segments = manifest.video.entries().len(),
            "Manifest loaded"
        );
        self.manifest_loaded_at = Some(Instant::now());
        Ok(self.manifest.insert(manifest))
    }

    /// Download the initialization segment of the selected representation.
    pub async fn init_segment(&mut self, media: MediaType) -> RestreamResult<Bytes> {
        if self.manifest.is_none() {
            self.load_manifest().await?;
        }
        let endpoint = self.session.ensure_fresh().await?;
        let path = self.loaded_manifest()?.track(media).init_path();
        let url = endpoint.resolve(&path)?;
        Ok(self.get(url).await?.bytes().await?)
    }

    /// Move both tracks to the start position behind the live edge of the
    /// loaded manifest.
    pub fn resync(&mut self) -> RestreamResult<()> {
        let manifest = self.loaded_manifest()?;
        let (video, audio) = (&manifest.video, &manifest.audio);

        let edge = video
            .live_edge_index(self.live_edge_holdback)
            .ok_or_else(|| RestreamError::ManifestError("empty video timeline".to_string()))?;
        let audio_edge = audio
            .live_edge_index(self.live_edge_holdback)
            .ok_or_else(|| RestreamError::ManifestError("empty audio timeline".to_string()))?;

        let video_entry = video.entries()[edge.saturating_sub(self.start_offset as usize)];

        // audio segment covering the same presentation time
        let audio_time = (video_entry.time as u128 * audio.timescale as u128
            / video.timescale.max(1) as u128) as u64;
        let audio_index = audio
            .first_after(audio_time)
            .saturating_sub(1)
            .min(audio_edge);
        let audio_entry = audio.entries()[audio_index];

        self.video = TrackCursor::at(&video_entry, &self.video);
        self.audio = TrackCursor::at(&audio_entry, &self.audio);

        tracing::debug!(
            channel = %self.channel,
            video = self.video.next_sequence,
            audio = self.audio.next_sequence,
            "Tracks synchronized"
        );
        Ok(())
    }

    fn cursor(&self, media: MediaType) -> &TrackCursor {
        match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        }
    }

    fn cursor_mut(&mut self, media: MediaType) -> &mut TrackCursor {
        match media {
            MediaType::Video => &mut self.video,
            MediaType::Audio => &mut self.audio,
        }
    }

    fn loaded_manifest(&self) -> RestreamResult<&Manifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| RestreamError::ManifestError("manifest not loaded".to_string()))
    }

    fn manifest_is_stale(&self) -> bool {
        self.manifest_loaded_at
            .map_or(true, |at| at.elapsed() >= self.manifest_refresh_interval)
    }

    fn lead(&self, media: MediaType) -> u64 {
        let (this, other) = match media {
            MediaType::Video => (&self.video, &self.audio),
            MediaType::Audio => (&self.audio, &self.video),
        };
        this.delivered.saturating_sub(other.delivered)
    }

    fn is_desynchronized(&self) -> bool {
        MediaType::ALL
            .iter()
            .any(|media| self.lead(*media) > self.desync_tolerance)
    }

    fn locate(&self, media: MediaType) -> RestreamResult<Location> {
        let track = self.loaded_manifest()?.track(media);
        let entries = track.entries();

        let Some(time) = self.cursor(media).next_time else {
            return Ok(Location::Behind);
        };
        let (Some(first), Some(last), Some(edge)) = (
            entries.first(),
            entries.last(),
            track.live_edge_index(self.live_edge_holdback),
        ) else {
            return Ok(Location::Ahead);
        };

        if time < first.time {
            return Ok(Location::Behind);
        }
        Ok(match track.position(time) {
            Some(index) if index <= edge => {
                let entry = entries[index];
                let next_time = entries
                    .get(index + 1)
                    .map_or(entry.time + entry.duration, |e| e.time);
                Location::Available { entry, next_time }
            }
            Some(_) => Location::Ahead,
            None if time > last.time => Location::Ahead,
            None => Location::Behind,
        })
    }

    /// Resynchronize after a track fell out of the timeline and describe the gap.
    fn skip_to_live(&mut self, media: MediaType) -> RestreamResult<RestreamError> {
        let sequence = self.cursor(media).next_sequence;
        self.resync()?;
        let resumed_at = self.cursor(media).next_sequence;

        tracing::warn!(
            channel = %self.channel,
            %media,
            sequence,
            resumed_at,
            "Segment left the available window, skipping to live edge"
        );
        Ok(RestreamError::SegmentGone {
            media,
            sequence,
            resumed_at,
        })
    }

    async fn get(&self, url: Url) -> RestreamResult<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(channel = %self.channel, %status, "Edge rejected the token");
            self.session.invalidate();
        }
        if !status.is_success() {
            return Err(RestreamError::HttpError(status));
        }
        Ok(response)
    }
}

impl SegmentSource for SegmentFetcher {
    async fn prime(&mut self) -> RestreamResult<Primed> {
        self.load_manifest().await?;
        let resynced = self.video.next_time.is_none()
            || self.audio.next_time.is_none()
            || self.is_desynchronized();
        if resynced {
            self.resync()?;
        }

        let video = self.init_segment(MediaType::Video).await?;
        let audio = self.init_segment(MediaType::Audio).await?;
        let mut header = BytesMut::with_capacity(video.len() + audio.len());
        header.extend_from_slice(&video);
        header.extend_from_slice(&audio);

        let manifest = self.loaded_manifest()?;
        tracing::info!(
            channel = %self.channel,
            video = %manifest.video.representation_id,
            audio = %manifest.audio.representation_id,
            video_init = video.len(),
            audio_init = audio.len(),
            "Init segments downloaded"
        );

        Ok(Primed {
            header: header.freeze(),
            video_representation: manifest.video.representation_id.clone(),
            audio_representation: manifest.audio.representation_id.clone(),
            resynced,
        })
    }

    async fn next_segment(&mut self, media: MediaType) -> RestreamResult<Segment> {
        let endpoint = self.session.ensure_fresh().await?;
        if self.manifest.is_none() || (self.window_suspect && self.manifest_is_stale()) {
            self.load_manifest().await?;
            self.window_suspect = false;
        }
        if self.cursor(media).next_time.is_none() {
            self.resync()?;
        }
        if self.lead(media) > self.desync_tolerance {
            return Err(RestreamError::Desynchronized {
                video: self.video.next_sequence,
                audio: self.audio.next_sequence,
            });
        }

        let mut reloaded = false;
        let (entry, next_time) = loop {
            match self.locate(media)? {
                Location::Available { entry, next_time } => break (entry, next_time),
                Location::Behind => return Err(self.skip_to_live(media)?),
                Location::Ahead if !reloaded && self.manifest_is_stale() => {
                    self.load_manifest().await?;
                    reloaded = true;
                }
                Location::Ahead => {
                    return Err(RestreamError::SegmentNotReady(
                        media,
                        self.cursor(media).next_sequence,
                    ))
                }
            }
        };

        // the manifest reload may have refreshed the token
        let endpoint = self.session.current_endpoint().unwrap_or(endpoint);
        let path = self.loaded_manifest()?.track(media).segment_path(&entry);
        let url = endpoint.resolve(&path)?;
        let sequence = self.cursor(media).next_sequence;

        let data = match self.get(url).await {
            Ok(response) => response.bytes().await?,
            Err(RestreamError::HttpError(StatusCode::NOT_FOUND)) => {
                self.window_suspect = true;
                return Err(RestreamError::SegmentNotReady(media, sequence));
            }
            Err(e) => return Err(e),
        };

        let cursor = self.cursor_mut(media);
        cursor.next_time = Some(next_time);
        cursor.next_sequence += 1;
        cursor.delivered += 1;

        tracing::trace!(channel = %self.channel, %media, sequence, size = data.len(), "Segment fetched");
        Ok(Segment {
            media,
            sequence,
            data,
        })
    }
}
