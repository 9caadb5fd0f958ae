use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{LiveBuffer, StreamReader},
    config::{ChannelConfig, EngineConfig},
    error::{RestreamError, RestreamResult},
    util::retry::{Backoff, RetryBudget},
    MediaType, Segment, SegmentSource,
};

/// Lifecycle of a channel.
///
/// ```text
/// Idle ──start──► Starting ──first chunk──► Live
///                    ▲  │                    │
///              start │  └──budget exhausted──┴──► Error
///                    └─────────────────────────────┘
/// any state ──stop──► Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Starting = 1,
    Live = 2,
    Error = 3,
    Stopped = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Starting,
            2 => ChannelState::Live,
            3 => ChannelState::Error,
            _ => ChannelState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Starting => "starting",
            ChannelState::Live => "live",
            ChannelState::Error => "error",
            ChannelState::Stopped => "stopped",
        }
    }

    /// Whether a fetch task is supposed to be running.
    pub fn is_running(&self) -> bool {
        matches!(self, ChannelState::Starting | ChannelState::Live)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct RuntimeDetails {
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    video_representation: Option<String>,
    audio_representation: Option<String>,
}

/// Live state of a channel. Written by the fetch task, read by status queries.
struct ChannelRuntime {
    state: AtomicU8,
    segments: AtomicU64,
    dropped: AtomicU64,
    transient_errors: AtomicU64,
    errors: AtomicU64,
    details: Mutex<RuntimeDetails>,
}

impl ChannelRuntime {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Idle as u8),
            segments: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            details: Mutex::new(RuntimeDetails::default()),
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move a running channel to `to`. Fails once the channel left Starting and Live.
    fn transition_running(&self, to: ChannelState) -> bool {
        self.transition(ChannelState::Starting, to) || self.transition(ChannelState::Live, to)
    }

    fn details(&self) -> MutexGuard<'_, RuntimeDetails> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_error(&self, error: &RestreamError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let message = error.to_string().chars().take(200).collect();
        self.details().last_error = Some(message);
    }
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub name: String,
    pub state: ChannelState,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_sec: u64,
    pub video_repr: Option<String>,
    pub audio_repr: Option<String>,
    /// Segments received from the upstream, video and audio.
    pub segments: u64,
    /// Segments skipped after falling behind the upstream window.
    pub dropped: u64,
    pub transient_errors: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub clients: usize,
    /// Chunks retained for new viewers.
    pub buffer_size: usize,
    pub buffer_bytes: usize,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One channel: a fetch task feeding a [LiveBuffer], driven by the state machine
/// described on [ChannelState].
pub struct ChannelWorker<S> {
    config: ChannelConfig,
    engine: Arc<EngineConfig>,
    runtime: Arc<ChannelRuntime>,
    buffer: Arc<LiveBuffer>,
    // shared with the fetch task so a restart continues from the same cursors
    source: Arc<tokio::sync::Mutex<SourceState<S>>>,
    task: Mutex<Option<RunningTask>>,
}

impl<S: SegmentSource> ChannelWorker<S> {
    pub fn new(config: ChannelConfig, engine: Arc<EngineConfig>, source: S) -> Self {
        let buffer = LiveBuffer::new(engine.retention_chunks, engine.retention_bytes);
        Self {
            config,
            engine,
            runtime: Arc::new(ChannelRuntime::new()),
            buffer,
            source: Arc::new(tokio::sync::Mutex::new(SourceState {
                source,
                pending: None,
            })),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> ChannelState {
        self.runtime.state()
    }

    pub fn buffer(&self) -> &Arc<LiveBuffer> {
        &self.buffer
    }

    /// Start fetching. No-op while already running; a stopped worker stays stopped.
    pub fn start(&self) -> ChannelStatus {
        let mut task = self.lock_task();
        loop {
            let current = self.runtime.state();
            match current {
                ChannelState::Starting | ChannelState::Live | ChannelState::Stopped => {
                    drop(task);
                    return self.status();
                }
                ChannelState::Idle | ChannelState::Error => {
                    if self.runtime.transition(current, ChannelState::Starting) {
                        break;
                    }
                }
            }
        }

        tracing::info!(channel = %self.config.id, name = %self.config.name, "Starting channel");
        *task = Some(self.spawn());
        drop(task);
        self.status()
    }

    /// Stop the channel for good: cancel the fetch task and end every reader.
    pub async fn stop(&self) -> ChannelStatus {
        loop {
            let current = self.runtime.state();
            if current == ChannelState::Stopped
                || self.runtime.transition(current, ChannelState::Stopped)
            {
                break;
            }
        }

        let task = self.lock_task().take();
        self.buffer.close();
        if let Some(task) = task {
            self.join(task).await;
            tracing::info!(channel = %self.config.id, "Channel stopped");
        }
        self.status()
    }

    /// Start over from the manifest and init segments. Recovers an errored channel
    /// and re-primes a running one.
    pub async fn restart(&self) -> ChannelStatus {
        let current = self.runtime.state();
        if !current.is_running() {
            return self.start();
        }

        let previous = self.lock_task().take();
        if let Some(task) = previous {
            self.join(task).await;
        }

        let mut task = self.lock_task();
        if self.runtime.transition_running(ChannelState::Starting)
            || self.runtime.transition(ChannelState::Error, ChannelState::Starting)
        {
            tracing::info!(channel = %self.config.id, "Restarting channel");
            *task = Some(self.spawn());
        }
        drop(task);
        self.status()
    }

    /// Attach a viewer. Refused while the channel is idle or stopped.
    pub fn open_reader(&self) -> RestreamResult<StreamReader> {
        match self.runtime.state() {
            ChannelState::Starting | ChannelState::Live | ChannelState::Error => {
                Ok(self.buffer.open_reader())
            }
            ChannelState::Idle | ChannelState::Stopped => {
                Err(RestreamError::ChannelNotRunning(self.config.id.clone()))
            }
        }
    }

    pub fn status(&self) -> ChannelStatus {
        let state = self.runtime.state();
        let details = self.runtime.details();
        let uptime_sec = match (state.is_running(), details.started_at) {
            (true, Some(started_at)) => (Utc::now() - started_at).num_seconds().max(0) as u64,
            _ => 0,
        };

        ChannelStatus {
            channel_id: self.config.id.clone(),
            name: self.config.name.clone(),
            state,
            running: state.is_running(),
            started_at: details.started_at,
            uptime_sec,
            video_repr: details.video_representation.clone(),
            audio_repr: details.audio_representation.clone(),
            segments: self.runtime.segments.load(Ordering::Relaxed),
            dropped: self.runtime.dropped.load(Ordering::Relaxed),
            transient_errors: self.runtime.transient_errors.load(Ordering::Relaxed),
            errors: self.runtime.errors.load(Ordering::Relaxed),
            last_error: details.last_error.clone(),
            clients: self.buffer.readers(),
            buffer_size: self.buffer.retained_chunks(),
            buffer_bytes: self.buffer.retained_bytes(),
        }
    }

    fn spawn(&self) -> RunningTask {
        self.runtime.details().started_at = Some(Utc::now());

        let cancel = CancellationToken::new();
        let fetch = FetchLoop {
            channel: self.config.id.clone(),
            engine: self.engine.clone(),
            runtime: self.runtime.clone(),
            buffer: self.buffer.clone(),
            source: self.source.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(fetch.run());
        RunningTask { cancel, handle }
    }

    async fn join(&self, task: RunningTask) {
        let RunningTask { cancel, mut handle } = task;
        cancel.cancel();
        if tokio::time::timeout(self.engine.stop_timeout, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(channel = %self.config.id, "Fetch task did not stop in time, aborting");
            handle.abort();
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Drop for ChannelWorker<S> {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
        }
        self.buffer.close();
    }
}

/// The source of a channel and the video segment still waiting for its audio
/// partner. The source has already moved past that segment, so it has to outlive
/// the fetch task which fetched it.
struct SourceState<S> {
    source: S,
    pending: Option<Segment>,
}

struct FetchLoop<S> {
    channel: String,
    engine: Arc<EngineConfig>,
    runtime: Arc<ChannelRuntime>,
    buffer: Arc<LiveBuffer>,
    source: Arc<tokio::sync::Mutex<SourceState<S>>>,
    cancel: CancellationToken,
}

impl<S: SegmentSource> FetchLoop<S> {
    async fn run(self) {
        let shared = self.source.clone();
        let mut state = tokio::select! {
            _ = self.cancel.cancelled() => return,
            guard = shared.lock() => guard,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(channel = %self.channel, "Fetch task cancelled");
            }
            _ = self.drive(&mut state) => {}
        }
    }

    async fn drive(&self, state: &mut SourceState<S>) {
        let mut budget = RetryBudget::new(self.engine.retry_budget, self.engine.failure_window);
        let mut backoff = Backoff::new(self.engine.backoff_base, self.engine.backoff_ceiling);
        let mut primed = false;
        let mut not_ready = 0;

        loop {
            if !primed {
                match state.source.prime().await {
                    Ok(init) => {
                        if init.resynced {
                            if let Some(video) = state.pending.take() {
                                self.runtime.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    channel = %self.channel,
                                    sequence = video.sequence,
                                    "Dropped unpaired video segment after resync"
                                );
                            }
                        }
                        self.buffer.set_header(init.header);
                        {
                            let mut details = self.runtime.details();
                            details.video_representation = Some(init.video_representation);
                            details.audio_representation = Some(init.audio_representation);
                        }
                        primed = true;
                    }
                    Err(e) => {
                        if self.fail(&mut budget, &mut backoff, e).await.is_break() {
                            return;
                        }
                        continue;
                    }
                }
            }

            let media = match state.pending {
                Some(_) => MediaType::Audio,
                None => MediaType::Video,
            };
            match state.source.next_segment(media).await {
                Ok(segment) => {
                    not_ready = 0;
                    self.runtime.segments.fetch_add(1, Ordering::Relaxed);

                    let Some(video) = state.pending.take() else {
                        state.pending = Some(segment);
                        continue;
                    };

                    let mut chunk = BytesMut::with_capacity(video.data.len() + segment.data.len());
                    chunk.extend_from_slice(&video.data);
                    chunk.extend_from_slice(&segment.data);
                    if self.buffer.append(chunk.freeze()).is_err() {
                        // closed by stop
                        return;
                    }

                    if self
                        .runtime
                        .transition(ChannelState::Starting, ChannelState::Live)
                    {
                        tracing::info!(channel = %self.channel, sequence = video.sequence, "Channel is live");
                    }
                    budget.reset();
                    backoff.reset();
                }
                Err(RestreamError::SegmentNotReady(media, sequence)) => {
                    self.runtime.transient_errors.fetch_add(1, Ordering::Relaxed);
                    not_ready += 1;
                    if not_ready >= self.engine.not_ready_limit {
                        not_ready = 0;
                        let stalled = RestreamError::UpstreamError(format!(
                            "{media} segment {sequence} still not published after {} attempts",
                            self.engine.not_ready_limit
                        ));
                        if self.fail(&mut budget, &mut backoff, stalled).await.is_break() {
                            return;
                        }
                    } else {
                        tokio::time::sleep(self.engine.not_ready_delay).await;
                    }
                }
                Err(RestreamError::SegmentGone {
                    sequence,
                    resumed_at,
                    ..
                }) => {
                    // both tracks moved, the pending video no longer has a partner
                    self.runtime.transient_errors.fetch_add(1, Ordering::Relaxed);
                    self.runtime
                        .dropped
                        .fetch_add(resumed_at.saturating_sub(sequence), Ordering::Relaxed);
                    state.pending = None;
                    not_ready = 0;
                }
                Err(e) => {
                    primed = false;
                    if self.fail(&mut budget, &mut backoff, e).await.is_break() {
                        return;
                    }
                }
            }
        }
    }

    /// Count a hard failure. Breaks once the retry budget is spent and the channel
    /// entered Error, otherwise waits out the backoff.
    async fn fail(
        &self,
        budget: &mut RetryBudget,
        backoff: &mut Backoff,
        error: RestreamError,
    ) -> ControlFlow<()> {
        self.runtime.record_error(&error);

        if budget.fail() {
            if self.runtime.transition_running(ChannelState::Error) {
                tracing::error!(
                    channel = %self.channel,
                    failures = budget.failures(),
                    "Channel failed: {error}"
                );
            }
            return ControlFlow::Break(());
        }

        let delay = backoff.next_delay();
        tracing::warn!(
            channel = %self.channel,
            failures = budget.failures(),
            retry_in = ?delay,
            "Fetch failed: {error}"
        );
        tokio::time::sleep(delay).await;
        ControlFlow::Continue(())
    }
}
