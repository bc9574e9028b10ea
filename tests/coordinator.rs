//! End-to-end coordinator scenarios on a paused clock

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{advance, config, drain, offer, Harness, MockTranscoder, MockTransport, ANSWER};
use sentinel_live::events::SystemEvent;
use sentinel_live::session::SessionState;
use sentinel_live::signaling::SdpOffer;
use sentinel_live::stream::StreamState;
use sentinel_live::transcode::Liveness;
use sentinel_live::AppError;

#[tokio::test(start_paused = true)]
async fn viewer_count_matches_registrations_minus_unregistrations() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(50));

    let registrations =
        futures::future::join_all((0..20).map(|_| h.registry.register_viewer("cam1"))).await;
    let ids: Vec<String> = registrations
        .into_iter()
        .map(|r| r.unwrap().session_id)
        .collect();
    assert_eq!(h.registry.viewer_count("cam1").await, 20);

    let leaving = &ids[..12];
    futures::future::join_all(leaving.iter().map(|id| h.registry.unregister_viewer(id))).await;
    assert_eq!(h.registry.viewer_count("cam1").await, 8);

    // Double unregistration never drives the count negative
    for id in leaving {
        assert!(h.registry.unregister_viewer(id).await.is_err());
    }
    assert_eq!(h.registry.viewer_count("cam1").await, 8);
    assert_eq!(h.transcoder.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_viewer_cycle_on_cam1() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(50));
    assert_eq!(h.controller.state("cam1"), StreamState::Idle);

    let a = h.registry.register_viewer("cam1").await.unwrap();
    assert_eq!(a.stream_state, StreamState::Live);
    assert_eq!(h.transcoder.starts(), 1);

    let answer = h.exchange.negotiate(&a.session_id, &offer()).await.unwrap();
    assert_eq!(answer.sdp, ANSWER);
    assert_eq!(*h.relay.paths.lock(), vec!["cam1".to_string()]);
    assert_eq!(
        h.registry.get_session(&a.session_id).unwrap().state,
        SessionState::Connected
    );

    h.registry.unregister_viewer(&a.session_id).await.unwrap();
    advance(9_900).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Live);
    assert_eq!(h.transcoder.stops(), 0);

    advance(200).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Idle);
    assert_eq!(h.transcoder.stops(), 1);

    advance(60_000).await;
    assert_eq!(h.transcoder.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_viewers_share_one_start() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(50));

    let (a, b) = tokio::join!(
        h.registry.register_viewer("cam1"),
        h.registry.register_viewer("cam1")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(h.transcoder.starts(), 1);

    let (offer_a, offer_b) = (offer(), offer());
    let (answer_a, answer_b) = tokio::join!(
        h.exchange.negotiate(&a.session_id, &offer_a),
        h.exchange.negotiate(&b.session_id, &offer_b)
    );
    assert!(answer_a.is_ok());
    assert!(answer_b.is_ok());

    for id in [&a.session_id, &b.session_id] {
        assert_eq!(
            h.registry.get_session(id).unwrap().state,
            SessionState::Connected
        );
    }
    assert_eq!(h.transcoder.starts(), 1);
    assert_eq!(h.registry.viewer_count("cam1").await, 2);
}

#[tokio::test(start_paused = true)]
async fn viewer_during_grace_keeps_stream_live() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(50));

    let a = h.registry.register_viewer("cam1").await.unwrap();
    h.registry.unregister_viewer(&a.session_id).await.unwrap();

    advance(5_000).await;
    let b = h.registry.register_viewer("cam1").await.unwrap();
    assert_eq!(b.stream_state, StreamState::Live);

    advance(30_000).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Live);
    assert_eq!(h.transcoder.stops(), 0);
    assert_eq!(h.transcoder.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_or_failed_camera_is_unavailable_without_relay_call() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));

    let err = h.exchange.negotiate_camera("cam1", &offer()).await.unwrap_err();
    assert!(matches!(err, AppError::CameraUnavailable(_)));

    let err = h.exchange.negotiate_camera("ghost", &offer()).await.unwrap_err();
    assert!(matches!(err, AppError::CameraUnavailable(_)));

    h.transcoder.fail.store(true, Ordering::SeqCst);
    let reg = h.registry.register_viewer("cam2").await.unwrap();
    assert_eq!(reg.stream_state, StreamState::Failed);
    let err = h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap_err();
    assert!(matches!(err, AppError::CameraUnavailable(_)));

    assert_eq!(h.relay.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_offer_is_rejected_before_the_relay() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let reg = h.registry.register_viewer("cam1").await.unwrap();

    for sdp in ["", "o=- 0 0 IN IP4 1.2.3.4\r\nm=video 9 RTP/AVP 96", "v=0\r\ns=-\r\n"] {
        let err = h
            .exchange
            .negotiate(&reg.session_id, &SdpOffer::new(sdp))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
    assert_eq!(h.relay.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn negotiation_times_out_before_the_relay_answers() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    h.relay.delay_ms.store(10_000, Ordering::SeqCst);
    let reg = h.registry.register_viewer("cam1").await.unwrap();

    let started = tokio::time::Instant::now();
    let err = h
        .exchange
        .negotiate(&reg.session_id, &offer())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::NegotiationTimeout { timeout_ms: 5_000 }
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
        h.registry.get_session(&reg.session_id).unwrap().state,
        SessionState::Negotiating
    );
}

#[tokio::test(start_paused = true)]
async fn relay_rejection_is_reported() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    h.relay.reject_status.store(404, Ordering::SeqCst);
    let reg = h.registry.register_viewer("cam1").await.unwrap();

    let err = h
        .exchange
        .negotiate(&reg.session_id, &offer())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RelayRejected { status: 404, .. }));
    assert_eq!(h.relay.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_delays_grow_until_the_budget_is_spent() {
    let mut config = config();
    config.reconnect.jitter_ratio = 0.2;
    let h = Harness::new(&config, MockTranscoder::with_delay(0));
    let mut rx = h.events.subscribe();

    let reg = h.registry.register_viewer("cam1").await.unwrap();
    h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap();

    let mut previous = 0;
    for attempt in 1..=5 {
        let plan = h.supervisor.on_drop(&reg.session_id).await.unwrap();
        assert_eq!(plan.attempt, attempt);
        assert!(plan.delay_ms >= previous);
        assert!(plan.delay_ms <= 8_000);
        previous = plan.delay_ms;
    }

    let err = h.supervisor.on_drop(&reg.session_id).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::RetryBudgetExhausted { attempts: 6, .. }
    ));
    assert!(h.registry.get_session(&reg.session_id).is_none());
    assert_eq!(h.registry.viewer_count("cam1").await, 0);

    let exhausted = drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, SystemEvent::SessionRetryExhausted { attempts: 6, .. }));
    assert!(exhausted);
}

#[tokio::test(start_paused = true)]
async fn supervisor_reconnects_a_dropped_viewer() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let reg = h.registry.register_viewer("cam1").await.unwrap();
    h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap();

    let transport = Arc::new(MockTransport::default());
    h.supervisor
        .supervise(&reg.session_id, transport.clone())
        .unwrap();
    assert_eq!(h.supervisor.active_supervisions(), 1);

    transport.drop_connection();
    advance(100).await;
    assert_eq!(
        h.registry.get_session(&reg.session_id).unwrap().state,
        SessionState::Reconnecting
    );

    // Base delay is 500ms without jitter
    advance(500).await;
    assert_eq!(transport.answers(), 1);
    let session = h.registry.get_session(&reg.session_id).unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.retry_count, 0);
    assert_eq!(h.relay.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn supervisor_closes_the_session_after_max_retries() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let reg = h.registry.register_viewer("cam1").await.unwrap();
    h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap();

    let transport = Arc::new(MockTransport::default());
    h.supervisor
        .supervise(&reg.session_id, transport.clone())
        .unwrap();
    h.relay.reject_status.store(503, Ordering::SeqCst);
    transport.drop_connection();

    // 500 + 1000 + 2000 + 4000 + 8000 ms of backoff, then the sixth failure
    advance(15_000).await;
    assert!(h.registry.get_session(&reg.session_id).is_some());
    advance(1_000).await;
    assert!(h.registry.get_session(&reg.session_id).is_none());
    assert_eq!(h.relay.calls(), 1 + 5);
    assert_eq!(h.supervisor.active_supervisions(), 0);

    // The last viewer is gone, so the upstream goes away after the grace period
    advance(10_100).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Idle);
    assert_eq!(h.transcoder.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_answers_count_toward_the_retry_budget() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let mut rx = h.events.subscribe();
    let reg = h.registry.register_viewer("cam1").await.unwrap();
    h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap();

    // The relay keeps answering but the viewer never gets media flowing
    let transport = Arc::new(MockTransport::default());
    transport.reject_answers.store(true, Ordering::SeqCst);
    h.supervisor
        .supervise(&reg.session_id, transport.clone())
        .unwrap();
    transport.drop_connection();

    // Failures at 0.5s and 1.5s; the third attempt waits until 3.5s
    advance(3_000).await;
    let session = h.registry.get_session(&reg.session_id).unwrap();
    assert_eq!(session.state, SessionState::Reconnecting);
    assert_eq!(session.retry_count, 3);

    // Same schedule as relay failures: closed at the 15.5s mark
    advance(12_000).await;
    assert!(h.registry.get_session(&reg.session_id).is_some());
    advance(1_000).await;
    assert!(h.registry.get_session(&reg.session_id).is_none());
    assert_eq!(transport.offers(), 5);
    assert_eq!(transport.answers(), 0);
    assert_eq!(h.relay.calls(), 1 + 5);
    assert_eq!(h.supervisor.active_supervisions(), 0);

    let exhausted = drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, SystemEvent::SessionRetryExhausted { attempts: 6, .. }));
    assert!(exhausted);

    // Nothing keeps retrying once the session is gone
    advance(600_000).await;
    assert_eq!(h.relay.calls(), 1 + 5);
}

#[tokio::test(start_paused = true)]
async fn unregistering_cancels_pending_reconnection() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let reg = h.registry.register_viewer("cam1").await.unwrap();
    h.exchange.negotiate(&reg.session_id, &offer()).await.unwrap();

    let transport = Arc::new(MockTransport::default());
    h.supervisor
        .supervise(&reg.session_id, transport.clone())
        .unwrap();
    transport.drop_connection();
    advance(100).await;

    h.registry.unregister_viewer(&reg.session_id).await.unwrap();
    advance(10_000).await;

    assert_eq!(transport.offers(), 0);
    assert_eq!(h.relay.calls(), 1);
    assert_eq!(h.supervisor.active_supervisions(), 0);
}

#[tokio::test(start_paused = true)]
async fn upstream_exit_restarts_while_viewers_remain() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    let mut rx = h.events.subscribe();
    let reg = h.registry.register_viewer("cam1").await.unwrap();
    assert_eq!(reg.stream_state, StreamState::Live);

    h.transcoder.report(0, Liveness::Exited(Some(1)));
    advance(10).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Failed);

    advance(1_100).await;
    assert_eq!(h.controller.state("cam1"), StreamState::Live);
    assert_eq!(h.transcoder.starts(), 2);

    let failed = drain(&mut rx)
        .into_iter()
        .any(|e| matches!(e, SystemEvent::StreamFailed { attempt: 1, terminal: false, .. }));
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_start_attempts_publish_terminal_failure() {
    let h = Harness::new(&config(), MockTranscoder::with_delay(0));
    h.transcoder.fail.store(true, Ordering::SeqCst);
    let mut rx = h.events.subscribe();

    let reg = h.registry.register_viewer("cam1").await.unwrap();
    assert_eq!(reg.stream_state, StreamState::Failed);

    // Retries after 1s and 2s; the third attempt is the last of the cycle
    advance(3_100).await;
    assert_eq!(h.transcoder.starts(), 3);

    let failures: Vec<(u32, bool)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SystemEvent::StreamFailed {
                attempt, terminal, ..
            } => Some((attempt, terminal)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(1, false), (2, false), (3, true)]);

    // Leaving during the hold returns the camera to Idle at once
    h.registry.unregister_viewer(&reg.session_id).await.unwrap();
    assert_eq!(h.controller.state("cam1"), StreamState::Idle);
    advance(60_000).await;
    assert_eq!(h.transcoder.starts(), 3);
}
