//! Session behavior over the in-memory transport, on paused time.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, future};
use serde_json::{Value, json};
use tasklink_core::{
    CloseReason, ConnectionEvent, Envelope, Identity, MessageKind, SubmitError, Task, TaskId,
    TaskStatus, TaskSubmitter, TransportError,
};
use tasklink_session::{
    AcceptMode, ChannelConfig, ChannelError, ConnectionState, MemoryConnector, MemoryPeer, Session,
};

fn config() -> ChannelConfig {
    ChannelConfig::default()
}

fn session_with(config: ChannelConfig) -> (Session, MemoryConnector) {
    let connector = MemoryConnector::new();
    let session = Session::with_identity(
        config,
        Arc::new(connector.clone()),
        Identity::new("client_test"),
    );
    (session, connector)
}

async fn connected(config: ChannelConfig) -> (Session, MemoryConnector, MemoryPeer) {
    let (session, connector) = session_with(config);
    session.connect().await.unwrap();
    let peer = connector.next_peer().await.unwrap();
    (session, connector, peer)
}

fn record_events(session: &Session) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.on_connection(None, move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn closes(events: &Mutex<Vec<ConnectionEvent>>) -> Vec<CloseReason> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Close { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

async fn task_matching(session: &Session, id: &str, pred: impl Fn(&Task) -> bool) -> Task {
    let id = id.to_string();
    let mut matching = session
        .updates()
        .filter(move |t| future::ready(t.id == id && pred(t)));
    tokio::time::timeout(Duration::from_secs(5), matching.next())
        .await
        .unwrap()
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_progress_complete_scenario() {
    let (session, _connector, peer) = connected(config()).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(peer.identity().as_str(), "client_test");

    peer.push_envelope(&Envelope::start("t1", None));
    peer.push_envelope(&Envelope::progress("t1", 40, None));
    peer.push_envelope(&Envelope::complete("t1", "r1"));

    let task = session.wait_for("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result.as_deref(), Some("r1"));
    assert_eq!(session.current_task().unwrap().id, "t1");
}

#[tokio::test(start_paused = true)]
async fn test_progress_without_start_creates_processing_task() {
    let (session, _connector, peer) = connected(config()).await;
    peer.push_envelope(&Envelope::progress("t2", 10, None));

    let task = task_matching(&session, "t2", |_| true).await;
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.progress, 10);
}

#[tokio::test(start_paused = true)]
async fn test_bad_frames_do_not_break_the_channel() {
    let (session, _connector, peer) = connected(config()).await;
    peer.push("not json");
    peer.push(r#"{"type":"progress","progress":5}"#);
    peer.push(r#"{"type":"teleport","task_id":"x"}"#);
    peer.push(r#"{"type":"progress","taskId":"t9","progress":12.6,"message":"legacy"}"#);

    let task = task_matching(&session, "t9", |_| true).await;
    assert_eq!(task.progress, 13);
    assert_eq!(task.message, "legacy");
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_see_typed_messages_in_order() {
    let (session, _connector, peer) = connected(config()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.on(MessageKind::Progress, move |e| {
        if let Envelope::Progress { progress, .. } = e {
            sink.lock().unwrap().push(*progress);
        }
    });

    for p in [10, 20, 30] {
        peer.push_envelope(&Envelope::progress("t", p, None));
    }
    peer.push_envelope(&Envelope::complete("t", "done"));
    session.wait_for("t").await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![10u8, 20, 30]);
}

#[tokio::test(start_paused = true)]
async fn test_server_ping_is_answered_with_pong() {
    let (_session, _connector, mut peer) = connected(config()).await;
    peer.push(r#"{"type":"ping","timestamp":12.5}"#);

    let reply = peer.recv_envelope().await.unwrap();
    assert_eq!(reply, Envelope::pong(Some(12.5)));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ping_sent_on_interval() {
    let (_session, _connector, mut peer) = connected(config()).await;
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(peer.try_recv().is_none());

    let frame = peer.recv_envelope().await.unwrap();
    assert_eq!(frame.kind(), MessageKind::Ping);
}

#[tokio::test(start_paused = true)]
async fn test_two_connects_make_one_attempt() {
    let (session, connector) = session_with(config());
    let (a, b) = tokio::join!(session.connect(), session.connect());
    a.unwrap();
    b.unwrap();
    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_within_cooldown_is_deferred() {
    let (session, connector) = session_with(config());
    session.connect().await.unwrap();
    session.disconnect().await;

    let early = tokio::time::timeout(Duration::from_millis(1_500), session.connect()).await;
    assert!(early.is_err());
    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Connecting);

    session.connect().await.unwrap();
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_are_bounded() {
    let (session, connector, mut peer) = connected(ChannelConfig {
        max_reconnect_attempts: 3,
        ..config()
    })
    .await;
    connector.set_mode(AcceptMode::Refuse);
    peer.close();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1 + 3);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_zero_attempts_disables_reconnect() {
    let (session, connector, mut peer) = connected(ChannelConfig {
        max_reconnect_attempts: 0,
        ..config()
    })
    .await;
    peer.close();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.connect().await.unwrap();
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_drop() {
    let (session, connector, mut peer) = connected(config()).await;
    let events = record_events(&session);
    peer.close();

    let mut second = connector.next_peer().await.unwrap();
    settle().await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.identity().as_str(), "client_test");
    assert_eq!(closes(&events), [CloseReason::Remote]);

    second.push_envelope(&Envelope::progress("after", 50, None));
    let task = task_matching(&session, "after", |_| true).await;
    assert_eq!(task.progress, 50);
    second.close();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_reported() {
    let (session, connector) = session_with(config());
    connector.set_mode(AcceptMode::Refuse);
    let events = record_events(&session);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Transport(TransportError::Connect(_))
    ));
    assert_eq!(session.state(), ConnectionState::ReconnectScheduled);
    assert!(matches!(
        events.lock().unwrap().first(),
        Some(ConnectionEvent::Error { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_connect_times_out() {
    let (session, connector) = session_with(ChannelConfig {
        max_reconnect_attempts: 0,
        ..config()
    });
    connector.set_mode(AcceptMode::Hang);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Transport(TransportError::Timeout(d)) if d == Duration::from_secs(10)
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_is_closed() {
    let (session, connector, _peer) = connected(config()).await;
    let events = record_events(&session);

    tokio::time::sleep(Duration::from_secs(79)).await;
    assert!(closes(&events).is_empty());

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(closes(&events), [CloseReason::Stale]);
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_traffic_substitutes_for_pong() {
    let (session, _connector, peer) = connected(config()).await;
    let events = record_events(&session);

    for p in 0..20 {
        tokio::time::sleep(Duration::from_secs(40)).await;
        peer.push_envelope(&Envelope::progress("long", p, None));
    }
    settle().await;
    assert!(closes(&events).is_empty());
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_suppressed_while_task_active() {
    let (session, connector, peer) = connected(ChannelConfig {
        smart_mode: true,
        idle_timeout_ms: 60_000,
        ..config()
    })
    .await;
    let events = record_events(&session);
    session.mark_task_active(true);

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        peer.push_envelope(&Envelope::ping());
    }
    settle().await;
    assert_eq!(session.state(), ConnectionState::Connected);

    session.mark_task_active(false);
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(session.state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(closes(&events), [CloseReason::Idle]);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_message_clears_active_flag() {
    let (session, _connector, peer) = connected(ChannelConfig {
        smart_mode: true,
        idle_timeout_ms: 60_000,
        ..config()
    })
    .await;
    session.mark_task_active_for("t");
    peer.push_envelope(&Envelope::complete("t", "r"));
    session.wait_for("t").await.unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_other_tasks_finishing_keep_idle_hold() {
    let (session, _connector, peer) = connected(ChannelConfig {
        smart_mode: true,
        idle_timeout_ms: 60_000,
        ..config()
    })
    .await;
    peer.push_envelope(&Envelope::complete("old", "r"));
    session.wait_for("old").await.unwrap();

    session.mark_task_active(true);
    peer.push_envelope(&Envelope::start("b", None));
    peer.push_envelope(&Envelope::complete("a", "r"));
    peer.push_envelope(&Envelope::complete("old", "r"));

    session.mark_task_active_for("c");
    peer.push_envelope(&Envelope::complete("a", "again"));

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        peer.push_envelope(&Envelope::ping());
    }
    settle().await;
    assert_eq!(session.state(), ConnectionState::Connected);

    peer.push_envelope(&Envelope::error("c", Some("boom".into())));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_finished_task_beyond_history() {
    let (session, _connector, peer) = connected(config()).await;
    peer.push_envelope(&Envelope::complete("done", "r"));
    session.wait_for("done").await.unwrap();

    for p in 0..1100u32 {
        peer.push_envelope(&Envelope::progress("busy", u8::try_from(p % 100).unwrap(), None));
    }
    settle().await;

    let task = tokio::time::timeout(Duration::from_secs(5), session.wait_for("done"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_close_fires_once_per_connection() {
    let (session, _connector, mut peer) = connected(ChannelConfig {
        max_reconnect_attempts: 0,
        ..config()
    })
    .await;
    let events = record_events(&session);

    peer.close();
    settle().await;
    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(closes(&events), [CloseReason::Remote]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_and_releases_identity() {
    let (session, _connector, peer) = connected(config()).await;
    let events = record_events(&session);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.status().identity.is_none());
    assert!(peer.is_closed());
    assert_eq!(closes(&events), [CloseReason::Local]);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_destroyed_session_refuses_everything() {
    let (session, _connector, _peer) = connected(config()).await;
    session.destroy().await;
    assert_eq!(session.state(), ConnectionState::Destroyed);
    assert!(matches!(
        session.connect().await,
        Err(ChannelError::Destroyed)
    ));
    assert!(matches!(
        session.send(Envelope::status_query()).await,
        Err(ChannelError::Destroyed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected() {
    let (session, connector) = session_with(config());

    session.send(Envelope::ping()).await.unwrap();
    assert_eq!(connector.attempts(), 0);

    let err = session.send(Envelope::status_query()).await.unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));
    let mut peer = connector.next_peer().await.unwrap();
    settle().await;
    assert_eq!(session.state(), ConnectionState::Connected);

    session.send(Envelope::status_query()).await.unwrap();
    assert_eq!(
        peer.recv().await.as_deref(),
        Some(r#"{"type":"status"}"#)
    );
}

#[tokio::test(start_paused = true)]
async fn test_identity_in_use_rejected() {
    let (session, _connector, _peer) = connected(config()).await;
    let err = session
        .connect_as(Identity::new("someone_else"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::IdentityInUse(id) if id.as_str() == "client_test"));
    session.connect_as(Identity::new("client_test")).await.unwrap();
}

struct Scripted(Result<Value, String>);

#[async_trait]
impl TaskSubmitter for Scripted {
    async fn submit(
        &self,
        identity: &Identity,
        task_id: &TaskId,
        payload: &Value,
    ) -> Result<Value, SubmitError> {
        assert_eq!(identity.as_str(), "client_test");
        assert_eq!(payload["text"], "hello");
        match &self.0 {
            Ok(response) => {
                let mut response = response.clone();
                response["task_id"] = json!(task_id);
                Ok(response)
            }
            Err(e) => Err(SubmitError::Rejected(e.clone())),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_submit_applies_result_from_response() {
    let (session, connector) = session_with(config());
    let submitter = Scripted(Ok(json!({"success": true, "result": "/outputs/a.wav"})));

    let task_id = session
        .submit(&submitter, &json!({"text": "hello"}))
        .await
        .unwrap();
    assert!(task_id.starts_with("task_"));
    assert_eq!(connector.attempts(), 1);

    let task = session.wait_for(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("/outputs/a.wav"));
}

#[tokio::test(start_paused = true)]
async fn test_submit_tracks_pending_until_channel_reports() {
    let (session, connector) = session_with(config());
    let submitter = Scripted(Ok(json!({"success": true})));

    let task_id = session
        .submit(&submitter, &json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(session.task(&task_id).unwrap().status, TaskStatus::Pending);

    let peer = connector.next_peer().await.unwrap();
    peer.push_envelope(&Envelope::progress(task_id.clone(), 30, None));
    let task = task_matching(&session, &task_id, |t| t.progress == 30).await;
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test(start_paused = true)]
async fn test_failed_submission_marks_task_errored() {
    let (session, _connector) = session_with(config());
    let submitter = Scripted(Err("queue full".into()));

    let err = session
        .submit(&submitter, &json!({"text": "hello"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Submit(_)));

    let task = session.current_task().unwrap();
    let task = session.wait_for(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error.unwrap().contains("queue full"));
}
