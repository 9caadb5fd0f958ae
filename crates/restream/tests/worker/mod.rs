use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use restream::{
    ChannelConfig, ChannelState, ChannelWorker, EngineConfig, RestreamError, StreamReader,
};
use url::Url;

use crate::{
    fast_engine, init_test_tracing,
    source::{Control, ScriptedSource, HEADER},
    wait_until, AssertWrapper,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn worker(engine: EngineConfig, control: &Control) -> Arc<ChannelWorker<ScriptedSource>> {
    init_test_tracing();
    let url = Url::parse("https://cdn.example.com/bpk-tv/001/tve/index.mpd").unwrap();
    let config = ChannelConfig::new("001", url).with_name("First");
    Arc::new(ChannelWorker::new(
        config,
        Arc::new(engine),
        ScriptedSource::new(control.clone()),
    ))
}

async fn wait_for_state(worker: &ChannelWorker<ScriptedSource>, state: ChannelState) {
    let reached = wait_until(TIMEOUT, || worker.state() == state).await;
    assert!(reached, "expected {state}, channel is {}", worker.state());
}

async fn read(reader: &mut StreamReader) -> Bytes {
    tokio::time::timeout(TIMEOUT, reader.read())
        .await
        .assert_success()
        .assert_success()
        .assert_success()
}

/// Read one chunk and return its sequence, checking that it pairs the video and
/// audio segments of the same sequence.
async fn read_pair(reader: &mut StreamReader) -> u64 {
    let chunk = read(reader).await;
    let text = std::str::from_utf8(&chunk).unwrap();
    let (video, audio) = text
        .strip_prefix('v')
        .and_then(|rest| rest.strip_suffix(';'))
        .and_then(|rest| rest.split_once(";a"))
        .unwrap_or_else(|| panic!("unexpected chunk {text}"));
    assert_eq!(video, audio, "mismatched pair {text}");
    video.parse().unwrap()
}

#[tokio::test]
async fn test_start_goes_live() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    assert_eq!(worker.state(), ChannelState::Idle);

    let status = worker.start();
    assert!(status.running);
    wait_for_state(&worker, ChannelState::Live).await;

    let status = worker.status();
    assert_eq!(status.channel_id, "001");
    assert_eq!(status.name, "First");
    assert_eq!(status.video_repr.as_deref(), Some("v1"));
    assert_eq!(status.audio_repr.as_deref(), Some("a1"));
    assert!(status.started_at.is_some());
    assert!(status.segments >= 2);

    let mut reader = worker.open_reader().assert_success();
    assert_eq!(&read(&mut reader).await[..], HEADER);
    let chunk = read(&mut reader).await;
    let text = std::str::from_utf8(&chunk).unwrap();
    // one chunk holds a video segment followed by its audio segment
    let (video, audio) = text.split_once(';').unwrap();
    assert_eq!(&video[1..], audio.trim_start_matches('a').trim_end_matches(';'));
    assert!(video.starts_with('v'));
}

#[tokio::test]
async fn test_repeated_start_spawns_one_task() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);

    for _ in 0..5 {
        worker.start();
    }
    wait_for_state(&worker, ChannelState::Live).await;
    for _ in 0..5 {
        assert_eq!(worker.start().state, ChannelState::Live);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(control.primes(), 1);
}

#[tokio::test]
async fn test_retry_budget_enters_error_and_recovers() {
    let control = Control::new();
    control.set_failing(true);
    let worker = worker(fast_engine(), &control);

    worker.start();
    wait_for_state(&worker, ChannelState::Error).await;
    let status = worker.status();
    assert_eq!(status.errors, 3);
    assert!(!status.running);
    assert_eq!(status.last_error.as_deref(), Some("Upstream error: prime failed"));
    assert_eq!(control.primes(), 3);

    // the task is gone, no further attempts
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(control.primes(), 3);

    // the buffer stays servable in Error
    worker.open_reader().assert_success();

    control.set_failing(false);
    assert_eq!(worker.start().state, ChannelState::Starting);
    wait_for_state(&worker, ChannelState::Live).await;
}

#[tokio::test]
async fn test_live_channel_enters_error_and_recovers_without_gap() {
    let control = Control::new();
    let engine = EngineConfig {
        retention_chunks: 1000,
        ..fast_engine()
    };
    let worker = worker(engine, &control);

    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;
    let mut reader = worker.open_reader().assert_success();
    assert_eq!(&read(&mut reader).await[..], HEADER);
    let mut expected = read_pair(&mut reader).await + 1;

    // the video segment is fetched, its audio partner keeps failing
    control.set_failing_audio(true);
    wait_for_state(&worker, ChannelState::Error).await;
    let status = worker.status();
    assert_eq!(status.errors, 3);
    assert_eq!(status.last_error.as_deref(), Some("Upstream error: segment failed"));
    let (_, produced) = worker.buffer().window();

    control.set_failing_audio(false);
    assert_eq!(worker.start().state, ChannelState::Starting);
    wait_for_state(&worker, ChannelState::Live).await;

    while reader.position() < produced + 3 {
        assert_eq!(read_pair(&mut reader).await, expected);
        expected += 1;
    }
    assert_eq!(worker.status().dropped, 0);
}

#[tokio::test]
async fn test_restart_keeps_pairs_aligned() {
    let control = Control::new();
    let engine = EngineConfig {
        retention_chunks: 1000,
        ..fast_engine()
    };
    let worker = worker(engine, &control);

    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;
    let mut reader = worker.open_reader().assert_success();
    assert_eq!(&read(&mut reader).await[..], HEADER);

    for delay in [3, 7, 11] {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        worker.restart().await;
    }

    let mut expected = read_pair(&mut reader).await + 1;
    for _ in 0..10 {
        assert_eq!(read_pair(&mut reader).await, expected);
        expected += 1;
    }
}

#[tokio::test]
async fn test_persistent_not_ready_consumes_budget() {
    let control = Control::new();
    control.set_not_ready(true);
    let engine = EngineConfig {
        not_ready_limit: 3,
        retry_budget: 2,
        ..fast_engine()
    };
    let worker = worker(engine, &control);

    worker.start();
    wait_for_state(&worker, ChannelState::Error).await;
    let status = worker.status();
    assert_eq!(status.errors, 2);
    assert!(status.transient_errors >= 6);
    assert!(status
        .last_error
        .unwrap_or_default()
        .contains("still not published"));
}

#[tokio::test]
async fn test_gone_segments_are_counted() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;

    control.inject_gone();
    let reached = wait_until(TIMEOUT, || worker.status().dropped == 5).await;
    assert!(reached);
    assert_eq!(worker.state(), ChannelState::Live);

    // still producing paired chunks after the skip
    let mut reader = worker.open_reader().assert_success();
    assert_eq!(&read(&mut reader).await[..], HEADER);
    for _ in 0..3 {
        let chunk = read(&mut reader).await;
        let text = std::str::from_utf8(&chunk).unwrap();
        let (video, audio) = text.split_once(';').unwrap();
        assert_eq!(&video[1..], &audio[1..audio.len() - 1]);
    }
}

#[tokio::test]
async fn test_stop_terminates_readers() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let mut reader = worker.open_reader().unwrap();
            tokio::spawn(async move {
                let mut chunks = 0;
                while let Ok(Some(_)) = reader.read().await {
                    chunks += 1;
                }
                chunks
            })
        })
        .collect();
    assert!(wait_until(TIMEOUT, || worker.status().clients == 3).await);

    let status = tokio::time::timeout(Duration::from_secs(1), worker.stop())
        .await
        .assert_success();
    assert_eq!(status.state, ChannelState::Stopped);
    assert!(!status.running);

    for reader in readers {
        let chunks = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .assert_success()
            .assert_success();
        assert!(chunks >= 1);
    }
    assert_eq!(worker.status().clients, 0);

    // stopped is terminal for the worker
    assert_eq!(worker.start().state, ChannelState::Stopped);
    assert!(matches!(
        worker.open_reader(),
        Err(RestreamError::ChannelNotRunning(_))
    ));
    let fetches = control.fetches();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(control.fetches(), fetches);
}

#[tokio::test]
async fn test_stop_interrupts_hanging_request() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;

    control.set_hang(true);
    let fetches = control.fetches();
    assert!(wait_until(TIMEOUT, || control.fetches() > fetches).await);

    let status = tokio::time::timeout(Duration::from_secs(1), worker.stop())
        .await
        .assert_success();
    assert_eq!(status.state, ChannelState::Stopped);
}

#[tokio::test]
async fn test_idle_channel_refuses_readers() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    assert!(matches!(
        worker.open_reader(),
        Err(RestreamError::ChannelNotRunning(id)) if id == "001"
    ));
}

#[tokio::test]
async fn test_restart_reprimes_running_channel() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;

    let status = worker.restart().await;
    assert_eq!(status.state, ChannelState::Starting);
    wait_for_state(&worker, ChannelState::Live).await;
    assert_eq!(control.primes(), 2);
}

#[tokio::test]
async fn test_late_reader_sees_same_bytes() {
    let control = Control::new();
    let worker = worker(fast_engine(), &control);
    worker.start();
    wait_for_state(&worker, ChannelState::Live).await;

    let mut first = worker.open_reader().unwrap();
    let mut seen = vec![read(&mut first).await];
    for _ in 0..5 {
        seen.push(read(&mut first).await);
    }

    let mut second = worker.open_reader().unwrap();
    // both start at an init boundary
    assert_eq!(&seen[0][..], HEADER);
    assert_eq!(&read(&mut second).await[..], HEADER);
    let mut late = Vec::new();
    for _ in 0..5 {
        late.push(read(&mut second).await);
    }

    let last = late.last().cloned().unwrap();
    while !seen.contains(&last) {
        seen.push(read(&mut first).await);
    }
    let start = seen.iter().position(|c| *c == late[0]).unwrap();
    assert_eq!(&seen[start..start + late.len()], &late[..]);
}
