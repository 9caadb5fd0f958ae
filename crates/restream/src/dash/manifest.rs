use dash_mpd::{AdaptationSet, Representation, SegmentTemplate, MPD};

use super::template::Template;
use crate::{
    error::{RestreamError, RestreamResult},
    MediaType,
};

/// One entry of an expanded `SegmentTimeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    /// `$Number$` of the segment.
    pub number: u64,
    /// `$Time$` of the segment, in timescale units.
    pub time: u64,
    pub duration: u64,
}

/// The selected representation of one media type.
#[derive(Debug, Clone)]
pub struct Track {
    pub media: MediaType,
    pub representation_id: String,
    pub bandwidth: u64,
    pub timescale: u64,

    /// Relative BaseURL prefix collected from MPD, Period, AdaptationSet and Representation.
    base_path: String,
    initialization: String,
    media_template: String,
    entries: Vec<TimelineEntry>,
}

impl Track {
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Index of the newest segment which may be requested, keeping `holdback`
    /// segments between it and the end of the timeline.
    pub fn live_edge_index(&self, holdback: u64) -> Option<usize> {
        let last = self.entries.len().checked_sub(1)?;
        Some(last.saturating_sub(holdback as usize))
    }

    /// Position of the segment starting at `time`.
    pub fn position(&self, time: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&time, |e| e.time).ok()
    }

    /// Index of the first segment starting after `time`.
    pub fn first_after(&self, time: u64) -> usize {
        self.entries.partition_point(|e| e.time <= time)
    }

    pub fn init_path(&self) -> String {
        let template = Template::new()
            .representation_id(&self.representation_id)
            .bandwidth(self.bandwidth);
        format!("{}{}", self.base_path, template.resolve(&self.initialization))
    }

    pub fn segment_path(&self, entry: &TimelineEntry) -> String {
        let template = Template::new()
            .representation_id(&self.representation_id)
            .bandwidth(self.bandwidth)
            .number(entry.number)
            .time(entry.time);
        format!("{}{}", self.base_path, template.resolve(&self.media_template))
    }
}

/// Video and audio tracks selected from a live manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub video: Track,
    pub audio: Track,
}

impl Manifest {
    /// Parse a manifest and select the audio track plus the best video track whose
    /// bandwidth does not exceed `video_bandwidth`.
    pub fn parse(text: &str, video_bandwidth: u64) -> RestreamResult<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mpd = dash_mpd::parse(text)?;
        Self::from_mpd(&mpd, video_bandwidth)
    }

    pub fn from_mpd(mpd: &MPD, video_bandwidth: u64) -> RestreamResult<Self> {
        // Only the first period is followed.
        let period = mpd
            .periods
            .first()
            .ok_or_else(|| RestreamError::ManifestError("no period".to_string()))?;

        // sibling BaseURLs are alternatives, nested levels are concatenated
        let mut base_path = String::new();
        for base in [mpd.base_url.first(), period.BaseURL.first()].into_iter().flatten() {
            push_base(&mut base_path, &base.base);
        }

        let mut video = None;
        let mut audio = None;
        for adaptation in &period.adaptations {
            let Some(media) = adaptation_media(adaptation) else {
                continue;
            };
            let slot = match media {
                MediaType::Video => &mut video,
                MediaType::Audio => &mut audio,
            };
            if slot.is_some() {
                continue;
            }

            let representation = match media {
                MediaType::Video => select_video(&adaptation.representations, video_bandwidth),
                MediaType::Audio => adaptation.representations.first(),
            };
            let Some(representation) = representation else {
                continue;
            };
            *slot = Some(build_track(media, &base_path, adaptation, representation)?);
        }

        Ok(Self {
            video: video.ok_or(RestreamError::NoRepresentationFound(MediaType::Video))?,
            audio: audio.ok_or(RestreamError::NoRepresentationFound(MediaType::Audio))?,
        })
    }

    pub fn track(&self, media: MediaType) -> &Track {
        match media {
            MediaType::Video => &self.video,
            MediaType::Audio => &self.audio,
        }
    }
}

fn adaptation_media(adaptation: &AdaptationSet) -> Option<MediaType> {
    MediaType::from_content_type(
        adaptation.contentType.as_deref(),
        adaptation.mimeType.as_deref(),
    )
    .or_else(|| {
        let representation = adaptation.representations.first()?;
        MediaType::from_content_type(None, representation.mimeType.as_deref())
    })
}

/// Last listed representation not above `limit`, otherwise the first one listed.
fn select_video(representations: &[Representation], limit: u64) -> Option<&Representation> {
    let mut candidates = representations.iter().filter(|r| r.id.is_some());
    candidates
        .clone()
        .filter(|r| r.bandwidth.unwrap_or(0) <= limit)
        .last()
        .or_else(|| candidates.next())
}

fn push_base(base_path: &mut String, base: &str) {
    if base.contains("://") || base.starts_with('/') {
        // absolute locations would bypass the edge token
        tracing::warn!(base, "Ignoring non-relative BaseURL");
        return;
    }
    base_path.push_str(base);
    if !base_path.is_empty() && !base_path.ends_with('/') {
        base_path.push('/');
    }
}

fn build_track(
    media: MediaType,
    base_path: &str,
    adaptation: &AdaptationSet,
    representation: &Representation,
) -> RestreamResult<Track> {
    let representation_id = representation
        .id
        .clone()
        .ok_or(RestreamError::NoRepresentationFound(media))?;

    let mut base_path = base_path.to_string();
    for base in [adaptation.BaseURL.first(), representation.BaseURL.first()]
        .into_iter()
        .flatten()
    {
        push_base(&mut base_path, &base.base);
    }

    let template = representation
        .SegmentTemplate
        .as_ref()
        .or(adaptation.SegmentTemplate.as_ref())
        .ok_or_else(|| {
            RestreamError::ManifestError(format!("{media} track has no SegmentTemplate"))
        })?;

    let initialization = template.initialization.clone().ok_or_else(|| {
        RestreamError::ManifestError(format!("{media} track has no initialization template"))
    })?;
    let media_template = template.media.clone().ok_or_else(|| {
        RestreamError::ManifestError(format!("{media} track has no media template"))
    })?;

    Ok(Track {
        media,
        representation_id,
        bandwidth: representation.bandwidth.unwrap_or(0),
        timescale: template.timescale.unwrap_or(1),
        base_path,
        initialization,
        media_template,
        entries: expand_timeline(template),
    })
}

fn expand_timeline(template: &SegmentTemplate) -> Vec<TimelineEntry> {
    let Some(timeline) = &template.SegmentTimeline else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut number = template.startNumber.unwrap_or(1);
    let mut time = timeline.segments.first().and_then(|s| s.t).unwrap_or(0);

    for s in &timeline.segments {
        if let Some(t) = s.t {
            time = t;
        }
        // negative repeat counts (repeat until the next S) are treated as a single segment
        let repeat = s.r.unwrap_or(0).max(0);
        for _ in 0..=repeat {
            entries.push(TimelineEntry {
                number,
                time,
                duration: s.d,
            });
            number += 1;
            time += s.d;
        }
    }

    entries
}
