mod common;

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use rusty_session::backend::{RemoteState, StatusReport, TransferStatus};
use rusty_session::path_inference::PathSource;
use rusty_session::router::SessionEvent;
use rusty_session::uploads::UploadState;
use rusty_session::{
    ConnectionSettings, Coordinator, CoordinatorSettings, OutputStream, SessionError, SessionId,
    SessionKind, SessionStatus, TabId, TermSize,
};

use common::{chunk, settle, wait_until, Call, MockBackend};

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        host: "build-01".into(),
        username: "ci".into(),
        ..Default::default()
    }
}

async fn connected() -> (std::sync::Arc<MockBackend>, Coordinator, SessionId) {
    let (backend, events) = MockBackend::new();
    let coordinator = Coordinator::new(backend.clone(), events, CoordinatorSettings::default());
    let id = SessionId::from("s1");
    let status = coordinator
        .open_session(
            id.clone(),
            TabId::from("t1"),
            SessionKind::Ssh,
            settings(),
            TermSize::default(),
        )
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Connected);
    (backend, coordinator, id)
}

fn output_seqs(stream: &mut OutputStream) -> Vec<u64> {
    stream
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Output(chunk) => Some(chunk.seq),
            SessionEvent::Status(_) => None,
        })
        .collect()
}

fn closed(message: &str) -> StatusReport {
    StatusReport {
        state: Some(RemoteState::Closed),
        message: Some(message.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn late_subscriber_gets_banner_and_history_once() {
    let (backend, coordinator, id) = connected().await;
    backend.set_banner(&id, vec![chunk(1, "Welcome to build-01\r\n")]);
    backend.emit_output(&id, 1, "Welcome to build-01\r\n");
    backend.emit_output(&id, 2, "ci@build-01:~$ ");
    settle().await;

    let mut stream = coordinator.subscribe_output(&id);
    assert_eq!(output_seqs(&mut stream), vec![1, 2]);

    backend.emit_output(&id, 2, "ci@build-01:~$ ");
    backend.emit_output(&id, 4, "d");
    backend.emit_output(&id, 3, "c");
    backend.emit_output(&id, 5, "e");
    settle().await;
    assert_eq!(output_seqs(&mut stream), vec![4, 5]);
}

#[tokio::test]
async fn every_subscriber_sees_the_same_stream() {
    let (backend, coordinator, id) = connected().await;
    let mut first = coordinator.subscribe_output(&id);
    let mut second = coordinator.subscribe_output(&id);
    let observer = coordinator.subscribe_events(&id);

    backend.emit_output(&id, 1, "a");
    backend.emit_output(&id, 2, "b");
    settle().await;

    assert_eq!(output_seqs(&mut first), vec![1, 2]);
    assert_eq!(output_seqs(&mut second), vec![1, 2]);
    assert_eq!(observer.drain().len(), 2);

    // A stream opened later replays the history on its own.
    let mut third = coordinator.subscribe_output(&id);
    assert_eq!(output_seqs(&mut third), vec![1, 2]);
}

#[tokio::test]
async fn events_for_unknown_sessions_are_dropped() {
    let (backend, coordinator, _id) = connected().await;
    let ghost = SessionId::from("ghost");
    backend.emit_output(&ghost, 1, "boo");
    backend.emit_status(&ghost, closed("gone"));
    settle().await;

    let mut stream = coordinator.subscribe_output(&ghost);
    assert!(stream.drain().is_empty());
    assert_eq!(coordinator.session_status(&ghost), None);
}

#[tokio::test]
async fn remote_close_marks_the_session_disconnected() {
    let (backend, coordinator, id) = connected().await;
    let mut stream = coordinator.subscribe_output(&id);

    backend.emit_status(&id, closed("connection reset by peer"));
    wait_until(|| coordinator.session_status(&id) == Some(SessionStatus::Disconnected)).await;

    let session = coordinator.session(&id).unwrap();
    assert_eq!(
        session.error_message.as_deref(),
        Some("connection reset by peer")
    );
    let statuses: Vec<StatusReport> = stream
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Status(report) => Some(report),
            SessionEvent::Output(_) => None,
        })
        .collect();
    assert_eq!(statuses.len(), 1);

    // Input for a dead session goes nowhere.
    coordinator.send_keystrokes(&id, "ls\r");
    coordinator.flush_input(&id).await;
    assert!(backend.inputs(&id).is_empty());
}

#[tokio::test]
async fn keystrokes_reach_the_backend_in_batches() {
    let (backend, coordinator, id) = connected().await;
    coordinator.send_keystrokes(&id, "l");
    coordinator.send_keystrokes(&id, "s");
    coordinator.send_keystrokes(&id, "\r");
    coordinator.flush_input(&id).await;
    assert_eq!(backend.inputs(&id), vec!["ls\r".to_string()]);

    coordinator.resize(&id, TermSize { cols: 120, rows: 40 }).await;
    assert_eq!(
        backend.calls().last(),
        Some(&Call::Resize(id.clone(), TermSize { cols: 120, rows: 40 }))
    );
}

#[tokio::test]
async fn close_discards_pending_input_and_state() {
    let (backend, coordinator, id) = connected().await;
    backend.emit_output(&id, 1, "history");
    settle().await;

    coordinator.send_keystrokes(&id, "exit\r");
    coordinator.close_session(&id).await;
    settle().await;

    assert!(backend.inputs(&id).is_empty());
    assert!(coordinator.session(&id).is_none());
    assert!(backend.calls().contains(&Call::Disconnect(id.clone())));
    assert!(coordinator.subscribe_output(&id).drain().is_empty());
}

#[tokio::test]
async fn reconnect_starts_a_fresh_stream() {
    let (backend, coordinator, id) = connected().await;
    backend.emit_output(&id, 1, "old");
    backend.emit_output(&id, 2, "old");
    backend.emit_status(&id, closed("timeout"));
    wait_until(|| coordinator.session_status(&id) == Some(SessionStatus::Disconnected)).await;

    let status = coordinator
        .open_session(
            id.clone(),
            TabId::from("t1"),
            SessionKind::Ssh,
            settings(),
            TermSize::default(),
        )
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Connected);
    assert_eq!(backend.connect_count(), 2);

    let mut stream = coordinator.subscribe_output(&id);
    assert!(stream.drain().is_empty());
    backend.emit_output(&id, 1, "new");
    settle().await;
    assert_eq!(output_seqs(&mut stream), vec![1]);
}

#[tokio::test]
async fn stream_held_across_reconnect_does_not_wipe_the_new_history() {
    let (backend, coordinator, id) = connected().await;
    let stale = coordinator.subscribe_output(&id);
    backend.emit_status(&id, closed("timeout"));
    wait_until(|| coordinator.session_status(&id) == Some(SessionStatus::Disconnected)).await;

    coordinator
        .open_session(
            id.clone(),
            TabId::from("t1"),
            SessionKind::Ssh,
            settings(),
            TermSize::default(),
        )
        .await
        .unwrap();
    backend.emit_output(&id, 1, "fresh");
    settle().await;

    drop(stale);
    let mut stream = coordinator.subscribe_output(&id);
    assert_eq!(output_seqs(&mut stream), vec![1]);
}

#[tokio::test]
async fn closing_disconnects_blocked_readers() {
    let (_backend, coordinator, id) = connected().await;
    let mut stream = coordinator.subscribe_output(&id);
    assert_eq!(
        stream.recv_timeout(Duration::from_millis(10)).err(),
        Some(RecvTimeoutError::Timeout)
    );

    coordinator.close_session(&id).await;
    assert_eq!(
        stream.recv_timeout(Duration::from_millis(10)).err(),
        Some(RecvTimeoutError::Disconnected)
    );
}

#[tokio::test]
async fn open_is_a_no_op_for_live_sessions() {
    let (backend, coordinator, id) = connected().await;
    backend.emit_output(&id, 1, "kept");
    settle().await;

    let status = coordinator
        .open_session(
            id.clone(),
            TabId::from("t1"),
            SessionKind::Ssh,
            settings(),
            TermSize::default(),
        )
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Connected);
    assert_eq!(backend.connect_count(), 1);
    assert_eq!(output_seqs(&mut coordinator.subscribe_output(&id)), vec![1]);
}

#[tokio::test]
async fn failed_sessions_can_be_evicted() {
    let (backend, events) = MockBackend::new();
    let coordinator = Coordinator::new(backend.clone(), events, CoordinatorSettings::default());
    backend.fail_connects("no route to host");
    let id = SessionId::from("s1");
    let result = coordinator
        .open_session(
            id.clone(),
            TabId::from("t1"),
            SessionKind::Ssh,
            settings(),
            TermSize::default(),
        )
        .await;
    assert!(matches!(result, Err(SessionError::Connect { .. })));
    assert_eq!(
        coordinator.session_status_by_tab(&TabId::from("t1")),
        Some(SessionStatus::Error)
    );

    let evicted = coordinator.evict_session(&id).unwrap();
    assert_eq!(evicted.status, SessionStatus::Error);
    assert!(coordinator.sessions().is_empty());
    assert!(!backend.calls().contains(&Call::Disconnect(id)));
}

#[tokio::test]
async fn home_directory_and_osc_hints_feed_upload_targets() {
    let (backend, coordinator, id) = connected().await;
    let nothing: Vec<String> = Vec::new();

    let target = coordinator.resolve_upload_target(&id, &nothing);
    assert_eq!(target.path, ".");
    assert!(target.is_relative);

    backend.emit_status(
        &id,
        StatusReport {
            state: Some(RemoteState::Connected),
            home_dir: Some("/home/ci".into()),
            ..Default::default()
        },
    );
    settle().await;
    let target = coordinator.resolve_upload_target(&id, &nothing);
    assert_eq!(target.path, "/home/ci");
    assert_eq!(target.source, PathSource::HomeDir);

    backend.emit_output(&id, 1, "\x1b]7;file://build-01/opt/data\x07ci@build-01:/opt/data$ ");
    settle().await;
    let target = coordinator.resolve_upload_target(&id, &nothing);
    assert_eq!(target.path, "/opt/data");
    assert_eq!(target.source, PathSource::LastKnown);
}

#[tokio::test]
async fn upload_follows_the_prompt_and_completes_on_progress() {
    let (backend, coordinator, id) = connected().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"payload").unwrap();
    let name = file
        .path()
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap()
        .to_string();

    let scrollback = vec![
        "ci@build-01:~$ cd /srv/app".to_string(),
        "ci@build-01:/srv/app$ ls".to_string(),
        "Cargo.toml  src".to_string(),
        "ci@build-01:/srv/app$ ".to_string(),
    ];
    let (task, remote) = coordinator
        .upload_file(&id, file.path(), &scrollback)
        .await
        .unwrap();
    assert_eq!(remote, format!("/srv/app/{name}"));
    assert_eq!(
        coordinator.upload_task(&task).unwrap().status,
        UploadState::Uploading
    );

    backend.emit_progress(&id, &task, TransferStatus::Uploading, 3, 7);
    backend.emit_progress(&id, &task, TransferStatus::Success, 7, 7);
    wait_until(|| {
        coordinator
            .upload_task(&task)
            .is_some_and(|t| t.status == UploadState::Success)
    })
    .await;

    assert_eq!(coordinator.clear_finished_uploads(), 1);
    assert!(coordinator.list_upload_tasks().is_empty());
}

#[tokio::test]
async fn upload_requires_a_connected_session() {
    let (backend, coordinator, id) = connected().await;
    let file = tempfile::NamedTempFile::new().unwrap();

    assert!(matches!(
        coordinator.create_upload(&SessionId::from("nope"), file.path()),
        Err(SessionError::UnknownSession(_))
    ));
    assert!(matches!(
        coordinator.create_upload(&id, Path::new("/")),
        Err(SessionError::InvalidLocalPath(_))
    ));

    backend.emit_status(&id, closed("eof"));
    wait_until(|| coordinator.session_status(&id) == Some(SessionStatus::Disconnected)).await;

    let nothing: Vec<String> = Vec::new();
    let result = coordinator.upload_file(&id, file.path(), &nothing).await;
    assert!(matches!(result, Err(SessionError::NotConnected(_))));
    let tasks = coordinator.list_upload_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, UploadState::Error);
    assert!(!backend
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Transfer { .. })));
}

#[tokio::test]
async fn shutdown_flushes_input_and_closes_everything() {
    let (backend, coordinator, id) = connected().await;
    coordinator.send_keystrokes(&id, "sync\r");
    coordinator.shutdown().await;

    assert_eq!(backend.inputs(&id), vec!["sync\r".to_string()]);
    assert!(backend.calls().contains(&Call::Disconnect(id)));
    assert_eq!(coordinator.stats().total, 0);
}

#[tokio::test]
async fn surfaces_can_feed_directory_hints_directly() {
    let (_backend, coordinator, id) = connected().await;
    coordinator.observe_terminal_output(&id, b"\x1b]7;file://build-01/var/log/nginx\x07");

    let nothing: Vec<String> = Vec::new();
    let target = coordinator.resolve_upload_target(&id, &nothing);
    assert_eq!(target.path, "/var/log/nginx");
    assert!(!target.is_relative);
}
