//! Data streams, teardown, reconnect and input liveness

#[macro_use]
mod common;

use common::{path_map, remote_offer, FakeBootstrap, FakeChannel, FakeEngine, Recorder};
use pathcast::domain::handler::{SessionHandler, StreamHandler};
use pathcast::domain::media::MediaInitOptions;
use pathcast::domain::shared::MediaKind;
use pathcast::domain::transport::{ConnectionState, StreamMessage, TransportEvent};
use pathcast::SessionError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

async fn connected(handler: SessionHandler) -> (FakeEngine, Arc<FakeBootstrap>, pathcast::Session) {
    common::init_tracing();
    let engine = FakeEngine::new();
    let bootstrap = FakeBootstrap::new();
    let session = common::session(&engine, &bootstrap, handler);
    assert_ok!(session.connect().await);
    (engine, bootstrap, session)
}

fn stream_handler(recorder: &Recorder) -> StreamHandler {
    let (open, message, close) = (recorder.clone(), recorder.clone(), recorder.clone());
    StreamHandler::new(move |label, msg| {
        if let StreamMessage::Text(text) = msg {
            message.push(format!("message {} {}", label, text));
        }
    })
    .on_open(move |label| {
        open.push(format!("open {}", label));
        true
    })
    .on_close(move |label| close.push(format!("close {}", label)))
}

#[tokio::test]
async fn test_published_stream_lifecycle() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let recorder = Recorder::new();

    assert_ok!(
        session
            .open_stream("chat", stream_handler(&recorder).publish(true))
            .await
    );
    let frame = engine.next_frame().await;
    assert_eq!(frame.function, "publish_stream");
    assert_eq!(frame.path(), Some("chat"));
    engine.reply(&frame, json!({}));
    eventually!(recorder.count("open chat") == 1);

    // reopening an existing stream is a no-op
    assert_ok!(session.open_stream("chat", stream_handler(&recorder)).await);
    assert_eq!(session.stream_labels().await, vec!["chat"]);

    engine.inject(TransportEvent::DataChannelMessage {
        label: "chat".to_string(),
        message: StreamMessage::Text("hi".to_string()),
    });
    eventually!(recorder.count("message chat hi") == 1);

    assert_ok!(session.send_stream("chat", "hello").await);
    let channel = engine.live().channel("chat").unwrap();
    assert_eq!(channel.sent(), vec!["hello"]);

    assert_ok!(session.close_stream("chat").await);
    assert!(channel.is_closed());
    assert_eq!(recorder.count("close chat"), 1);
    assert!(matches!(
        session.send_stream("chat", "late").await,
        Err(SessionError::Resource(_))
    ));
    assert_err!(session.close_stream("chat").await);
}

#[tokio::test]
async fn test_watch_stream_uses_watch_label() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let recorder = Recorder::new();
    assert_ok!(session.watch_stream("alice/chat", stream_handler(&recorder)).await);
    eventually!(recorder.count("open $watch/alice/chat") == 1);
    assert_eq!(session.stream_labels().await, vec!["$watch/alice/chat"]);
    assert!(engine.live().channel("$watch/alice/chat").is_some());
}

#[tokio::test]
async fn test_rejected_stream_is_closed() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let handler = StreamHandler::new(|_, _| {}).on_open(|_| false);
    assert_ok!(session.open_stream("chat", handler).await);
    eventually!(session.stream_labels().await.is_empty());
    assert!(engine.live().channel("chat").unwrap().is_closed());
}

#[tokio::test]
async fn test_stream_closed_by_engine_calls_on_close() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let recorder = Recorder::new();
    assert_ok!(session.open_stream("chat", stream_handler(&recorder)).await);
    engine.inject(TransportEvent::DataChannelClose {
        label: "chat".to_string(),
    });
    eventually!(recorder.count("close chat") == 1);
    assert!(session.stream_labels().await.is_empty());
}

#[tokio::test]
async fn test_remote_streams_follow_on_stream() {
    let recorder = Recorder::new();
    let accepted = recorder.clone();
    let handler = SessionHandler::new().on_stream(move |label| {
        (label == "feed").then(|| stream_handler(&accepted))
    });
    let (engine, _bootstrap, session) = connected(handler).await;
    let (frames, _rx) = mpsc::unbounded_channel();

    let refused = FakeChannel::new("other", frames.clone());
    engine.inject(TransportEvent::RemoteDataChannel {
        channel: refused.clone(),
    });
    let feed = FakeChannel::new("feed", frames);
    engine.inject(TransportEvent::RemoteDataChannel {
        channel: feed.clone(),
    });

    eventually!(refused.is_closed());
    eventually!(session.stream_labels().await == vec!["feed"]);
    assert!(!feed.is_closed());

    engine.inject(TransportEvent::DataChannelMessage {
        label: "feed".to_string(),
        message: StreamMessage::Text("tick".to_string()),
    });
    eventually!(recorder.count("message feed tick") == 1);
}

#[tokio::test]
async fn test_remote_stream_refused_without_on_stream() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let (frames, _rx) = mpsc::unbounded_channel();
    let channel = FakeChannel::new("feed", frames);
    engine.inject(TransportEvent::RemoteDataChannel {
        channel: channel.clone(),
    });
    eventually!(channel.is_closed());
    assert!(session.stream_labels().await.is_empty());
}

#[tokio::test]
async fn test_close_notifies_remote_peer() {
    let recorder = Recorder::new();
    let closed = recorder.clone();
    let handler = SessionHandler::new().on_close(move || {
        closed.push("session close".to_string());
        None
    });
    let (engine, _bootstrap, session) = connected(handler).await;
    assert_ok!(session.open_stream("chat", stream_handler(&recorder)).await);

    let closer = {
        let session = session.clone();
        tokio::spawn(async move { session.close().await })
    };
    let frame = engine.next_frame().await;
    assert_eq!(frame.function, "close");
    engine.reply(&frame, json!({}));
    closer.await.unwrap();

    assert!(!session.is_connected().await);
    assert!(!session.is_negotiated().await);
    assert!(session.session_id().await.is_none());
    assert!(session.stream_labels().await.is_empty());
    assert!(engine.live().is_closed());
    assert_eq!(recorder.count("close chat"), 1);
    assert_eq!(recorder.count("session close"), 1);
    assert_eq!(session.reconnect_count().await, 0);
}

#[tokio::test]
async fn test_teardown_closes_tracks() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new().on_close(|| None)).await;
    let recorder = Recorder::new();
    let watcher = {
        let session = session.clone();
        let handler = recorder.media_handler();
        tokio::spawn(async move {
            session
                .watch_media("alice/cam/video", handler, MediaInitOptions::default())
                .await
        })
    };
    let frame = engine.next_frame().await;
    engine.reply(
        &frame,
        json!({
            "sdp": remote_offer(&[("1", MediaKind::Video, true)]),
            "mid_media_path_map": path_map(&[("1", "alice/cam/video")]),
        }),
    );
    assert_ok!(watcher.await.unwrap());
    eventually!(recorder.count("open") == 1);

    engine.notify("close", json!({}));
    eventually!(!session.is_connected().await);
    assert_eq!(recorder.count("close alice/cam/video"), 1);
    assert!(session.media_paths().await.is_empty());
    assert_eq!(session.generation().await, 0);
}

#[tokio::test]
async fn test_close_track_notification() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let recorder = Recorder::new();
    let watcher = {
        let session = session.clone();
        let handler = recorder.media_handler();
        tokio::spawn(async move {
            session
                .watch_media("alice/cam/video", handler, MediaInitOptions::default())
                .await
        })
    };
    let frame = engine.next_frame().await;
    engine.reply(
        &frame,
        json!({
            "sdp": remote_offer(&[("1", MediaKind::Video, true)]),
            "mid_media_path_map": path_map(&[("1", "alice/cam/video")]),
        }),
    );
    assert_ok!(watcher.await.unwrap());
    eventually!(recorder.count("open") == 1);

    engine.notify("close_track", json!({"path": "alice/cam/video"}));
    eventually!(session.media_paths().await.is_empty());
    assert_eq!(recorder.count("close alice/cam/video"), 1);
    assert!(session.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_close_reconnects_after_callback_wait() {
    let handler = SessionHandler::new().on_close(|| Some(2_000_000_000));
    let (engine, bootstrap, session) = connected(handler).await;

    // the close notice stays unanswered and times out after one liveness tick
    session.close().await;
    assert!(!session.is_connected().await);
    assert_eq!(session.reconnect_count().await, 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.connections(), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    eventually!(session.is_negotiated().await);
    assert_eq!(engine.connections(), 2);
    assert_eq!(bootstrap.requests().len(), 2);
    assert_eq!(session.session_id().await.as_deref(), Some("remote-session"));
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_when_callback_declines() {
    let handler = SessionHandler::new().on_close(|| Some(0));
    let (engine, _bootstrap, session) = connected(handler).await;
    session.close().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(engine.connections(), 1);
    assert_eq!(session.reconnect_count().await, 0);
    assert!(!session.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connection_reconnects_with_default_wait() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    engine.inject(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
    eventually!(session.reconnect_count().await == 1);
    assert!(!session.is_connected().await);

    tokio::time::sleep(Duration::from_secs(6)).await;
    eventually!(session.is_negotiated().await);
    assert_eq!(engine.connections(), 2);

    session.close().await;
    assert!(!session.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_silent_media_pauses_and_resubscribes() {
    let (engine, _bootstrap, session) = connected(SessionHandler::new()).await;
    let recorder = Recorder::new();
    let watcher = {
        let session = session.clone();
        let handler = recorder.media_handler();
        tokio::spawn(async move {
            session
                .watch_media("alice/cam/video", handler, MediaInitOptions::default())
                .await
        })
    };
    let frame = engine.next_frame().await;
    let answer = json!({
        "sdp": remote_offer(&[("1", MediaKind::Video, true)]),
        "mid_media_path_map": path_map(&[("1", "alice/cam/video")]),
    });
    engine.reply(&frame, answer.clone());
    assert_ok!(watcher.await.unwrap());
    eventually!(recorder.count("open") == 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let frame = engine.next_frame().await;
    assert_eq!(frame.function, "consume");
    assert_eq!(frame.path(), Some("alice/cam/video"));
    assert_eq!(frame.args()["initOptions"]["sync"], json!(true));
    assert_eq!(recorder.count("pause alice/cam/video remote_close"), 1);
    engine.reply(&frame, answer);

    engine.notify("ping", json!({"path": "alice/cam/video"}));
    eventually!(recorder.count("resume alice/cam/video remote_close") == 1);
    assert!(!session.track_info("alice/cam/video").await.unwrap().paused());
    assert_eq!(recorder.count("open"), 1);
}

#[tokio::test]
async fn test_concurrent_teardowns_close_once() {
    let recorder = Recorder::new();
    let closed = recorder.clone();
    let handler = SessionHandler::new().on_close(move || {
        closed.push("session close".to_string());
        Some(60_000_000_000)
    });
    let (engine, _bootstrap, session) = connected(handler).await;

    engine.inject(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
    engine.notify("close", json!({}));
    eventually!(session.reconnect_count().await == 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.count("session close"), 1);
    assert_eq!(session.reconnect_count().await, 1);
    assert!(!session.is_connected().await);
    session.close().await;
}

#[tokio::test]
async fn test_failed_handshake_skips_on_close() {
    common::init_tracing();
    let engine = FakeEngine::new();
    let bootstrap = FakeBootstrap::new();
    bootstrap.respond_with(None, &[]);
    let recorder = Recorder::new();
    let closed = recorder.clone();
    let handler = SessionHandler::new().on_close(move || {
        closed.push("session close".to_string());
        None
    });
    let session = common::session(&engine, &bootstrap, handler);

    assert!(matches!(
        session.connect().await,
        Err(SessionError::Negotiation(_))
    ));
    assert!(!session.is_connected().await);
    assert!(engine.live().is_closed());
    assert_eq!(recorder.count("session close"), 0);
    assert_eq!(session.reconnect_count().await, 0);
}
