use restream::{
    ChannelConfig, HttpClient, MediaType, RestreamError, SegmentFetcher, SegmentSource,
};
use url::Url;
use wiremock::{
    matchers::{method, path, path_regex, query_param},
    Mock, MockServer, Request, ResponseTemplate,
};

use crate::{fast_engine, init_test_tracing, AssertWrapper};

/// Ten two-second segments per track, video starting at `first` (in segments).
fn manifest(first: u64) -> String {
    let video_t = first * 180000;
    let audio_t = first * 96000;
    let number = first + 1;
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT2S">
  <Period id="1" start="PT0S">
    <BaseURL>dash/</BaseURL>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="90000" initialization="$RepresentationID$_init.mp4" media="$RepresentationID$_$Time$.m4s" startNumber="{number}">
        <SegmentTimeline><S t="{video_t}" d="180000" r="9"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v_low" bandwidth="500000"/>
      <Representation id="v_mid" bandwidth="1087600"/>
      <Representation id="v_high" bandwidth="2500000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" initialization="$RepresentationID$_init.mp4" media="$RepresentationID$_$Number%05d$.m4s" startNumber="{number}">
        <SegmentTimeline><S t="{audio_t}" d="96000" r="9"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a_main" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#
    )
}

/// Entry point redirecting to an edge path with a query token; the edge serves
/// the manifest, init segments, and media segments echoing their own path.
async fn setup_cdn(server: &MockServer, first: u64) {
    init_test_tracing();
    Mock::given(method("GET"))
        .and(path("/live/001/index.mpd"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("Location", "/edge/live/001/index.mpd?token=abc"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/edge/live/001/index.mpd"))
        .and(query_param("token", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest(first)))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/edge/live/001/dash/[a-z_]+_init\.mp4$"))
        .and(query_param("token", "abc"))
        .respond_with(|req: &Request| {
            let name = req.url.path().rsplit('/').next().unwrap_or_default();
            ResponseTemplate::new(200).set_body_string(format!("[{name}]"))
        })
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/edge/live/001/dash/[a-z_]+_\d+\.m4s$"))
        .and(query_param("token", "abc"))
        .respond_with(|req: &Request| {
            let name = req.url.path().rsplit('/').next().unwrap_or_default();
            ResponseTemplate::new(200).set_body_string(name.to_string())
        })
        .mount(server)
        .await;
}

fn fetcher(server: &MockServer) -> SegmentFetcher {
    let url = Url::parse(&format!("{}/live/001/index.mpd", server.uri())).unwrap();
    let config = ChannelConfig::new("001", url);
    let client = HttpClient::builder().build().unwrap();
    SegmentFetcher::new(client, &config, &fast_engine()).unwrap()
}

#[tokio::test]
async fn test_prime_and_fetch_pairs() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);

    let primed = fetcher.prime().await?;
    assert_eq!(&primed.header[..], b"[v_mid_init.mp4][a_main_init.mp4]");
    assert_eq!(primed.video_representation, "v_mid");
    assert_eq!(primed.audio_representation, "a_main");

    // live edge is index 7, start five segments behind it
    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 3);
    assert_eq!(&video.data[..], b"v_mid_360000.m4s");

    let audio = fetcher.next_segment(MediaType::Audio).await?;
    assert_eq!(audio.sequence, 3);
    assert_eq!(&audio.data[..], b"a_main_00003.m4s");

    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 4);
    assert_eq!(&video.data[..], b"v_mid_540000.m4s");
    Ok(())
}

#[tokio::test]
async fn test_not_ready_beyond_live_edge() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;

    // indexes 2..=7 are available
    for sequence in 3..=8 {
        let video = fetcher.next_segment(MediaType::Video).await?;
        let audio = fetcher.next_segment(MediaType::Audio).await?;
        assert_eq!(video.sequence, sequence);
        assert_eq!(audio.sequence, sequence);
    }

    for _ in 0..2 {
        let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
        assert!(matches!(err, RestreamError::SegmentNotReady(MediaType::Video, 9)));
    }
    assert_eq!(fetcher.next_sequence(MediaType::Video), 9);

    // the edge moves on
    server.reset().await;
    setup_cdn(&server, 1).await;
    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 9);
    assert_eq!(&video.data[..], b"v_mid_1440000.m4s");
    Ok(())
}

#[tokio::test]
async fn test_missing_segment_is_not_ready() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/edge/live/001/dash/v_mid_360000.m4s"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;

    let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
    assert!(matches!(err, RestreamError::SegmentNotReady(MediaType::Video, 3)));

    // retried, not skipped
    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 3);
    assert_eq!(&video.data[..], b"v_mid_360000.m4s");
    Ok(())
}

#[tokio::test]
async fn test_fallen_behind_resyncs_to_live() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;
    fetcher.next_segment(MediaType::Video).await.assert_success();
    fetcher.next_segment(MediaType::Audio).await.assert_success();

    // the window moved twenty segments while we were away
    server.reset().await;
    setup_cdn(&server, 20).await;
    fetcher.load_manifest().await?;

    let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
    match err {
        RestreamError::SegmentGone {
            media,
            sequence,
            resumed_at,
        } => {
            assert_eq!(media, MediaType::Video);
            assert_eq!(sequence, 4);
            assert_eq!(resumed_at, 23);
        }
        e => panic!("unexpected error: {e}"),
    }

    // both tracks continue from the new position
    let video = fetcher.next_segment(MediaType::Video).await?;
    let audio = fetcher.next_segment(MediaType::Audio).await?;
    assert_eq!(video.sequence, 23);
    assert_eq!(audio.sequence, 23);
    assert_eq!(&audio.data[..], b"a_main_00023.m4s");
    Ok(())
}

#[tokio::test]
async fn test_tracks_stay_in_lockstep() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;

    for _ in 0..3 {
        fetcher.next_segment(MediaType::Video).await?;
    }
    let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
    assert!(matches!(
        err,
        RestreamError::Desynchronized { video: 6, audio: 3 }
    ));

    // the lagging track may still advance
    let audio = fetcher.next_segment(MediaType::Audio).await?;
    assert_eq!(audio.sequence, 3);
    Ok(())
}

#[tokio::test]
async fn test_rejected_token_is_refreshed() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/edge/live/001/dash/v_mid_360000.m4s"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;
    assert_eq!(fetcher.session().refresh_count(), 1);

    let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
    assert!(err.is_auth_rejected());

    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 3);
    assert_eq!(fetcher.session().refresh_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_token_failure_does_not_advance() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let mut fetcher = fetcher(&server);
    fetcher.prime().await?;
    fetcher.session().invalidate();

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/live/001/index.mpd"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let err = fetcher.next_segment(MediaType::Video).await.unwrap_err();
    assert!(matches!(err, RestreamError::TokenRefreshFailed(_)));
    assert_eq!(fetcher.next_sequence(MediaType::Video), 3);

    server.reset().await;
    setup_cdn(&server, 0).await;
    let video = fetcher.next_segment(MediaType::Video).await?;
    assert_eq!(video.sequence, 3);
    Ok(())
}

#[tokio::test]
async fn test_bandwidth_limit_per_channel() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    setup_cdn(&server, 0).await;
    let url = Url::parse(&format!("{}/live/001/index.mpd", server.uri()))?;
    let config = ChannelConfig::new("001", url).with_video_bandwidth(5_000_000);
    let client = HttpClient::builder().build()?;
    let mut fetcher = SegmentFetcher::new(client, &config, &fast_engine())?;

    let primed = fetcher.prime().await?;
    assert_eq!(primed.video_representation, "v_high");
    Ok(())
}
