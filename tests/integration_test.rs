use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskq_client::{ConfigBuilder, Connection, TaskData, TaskqError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

/// What the mock server does after reading a line.
enum Action {
    Reply(String),
    /// Writes the reply after a pause.
    Later(Duration, String),
    /// Writes the reply in pieces, pausing briefly between them.
    Pieces(Vec<String>),
    Ignore,
    HangUp,
}

/// A line-protocol server whose behavior is scripted per connection.
///
/// Connections are numbered from 0 in accept order; every received line is
/// recorded together with the number of the connection it arrived on.
struct MockServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    lines: mpsc::UnboundedReceiver<(usize, String)>,
}

impl MockServer {
    async fn start<F>(behave: F) -> Self
    where
        F: Fn(usize, &str) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, lines) = mpsc::unbounded_channel();
        let behave = Arc::new(behave);

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                let behave = Arc::clone(&behave);

                tokio::spawn(async move {
                    let (reader, mut writer) = socket.into_split();
                    let mut reader = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        let action = behave(index, &line);
                        let _ = tx.send((index, line));
                        match action {
                            Action::Reply(reply) => {
                                let _ = writer.write_all(reply.as_bytes()).await;
                            }
                            Action::Later(pause, reply) => {
                                tokio::time::sleep(pause).await;
                                let _ = writer.write_all(reply.as_bytes()).await;
                            }
                            Action::Pieces(pieces) => {
                                for piece in pieces {
                                    let _ = writer.write_all(piece.as_bytes()).await;
                                    let _ = writer.flush().await;
                                    tokio::time::sleep(Duration::from_millis(5)).await;
                                }
                            }
                            Action::Ignore => {}
                            Action::HangUp => break,
                        }
                    }
                });
            }
        });

        Self {
            port,
            accepted,
            lines,
        }
    }

    /// Replies `reply` to every `ASK` and stays silent otherwise.
    async fn answering(reply: &'static str) -> Self {
        Self::start(move |_, line| {
            if line.starts_with("ASK") {
                Action::Reply(reply.to_string())
            } else {
                Action::Ignore
            }
        })
        .await
    }

    fn config(&self) -> ConfigBuilder {
        ConfigBuilder::new()
            .host("127.0.0.1")
            .port(self.port)
            .response_timeout_ms(2000)
            .schedule_grace_ms(50)
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    async fn next_line(&mut self) -> (usize, String) {
        timeout(Duration::from_secs(2), self.lines.recv())
            .await
            .expect("server saw no line")
            .expect("server stopped")
    }
}

#[tokio::test]
async fn test_open_reachable_server() {
    let server = MockServer::answering("NOPE").await;

    let conn = assert_ok!(Connection::open("127.0.0.1", server.port, false).await);
    assert!(conn.is_active());
    assert!(!conn.json_mode());
}

#[tokio::test]
async fn test_open_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = assert_err!(Connection::open("127.0.0.1", port, false).await);
    assert!(matches!(err, TaskqError::Connection(_)));
}

#[tokio::test]
async fn test_close_sends_end() {
    let mut server = MockServer::answering("NOPE").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let closed = conn.close().await;

    assert!(!closed.is_active());
    assert_eq!(server.next_line().await, (0, "END".to_string()));
}

#[tokio::test]
async fn test_get_task_sample_payload() {
    let mut server = MockServer::answering("WANT? this is a sample task").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = assert_ok!(conn.get_task("").await).expect("a task");

    assert_eq!(
        task.data(),
        &TaskData::Text("this is a sample task".to_string())
    );
    assert_eq!(task.origin(), None);
    assert_eq!(server.next_line().await, (0, "ASK ".to_string()));
}

#[tokio::test]
async fn test_get_task_nothing_available() {
    let server = MockServer::answering("NOPE\n").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    assert!(assert_ok!(conn.get_task("").await).is_none());
}

#[tokio::test]
async fn test_get_task_from_named_queue_records_origin() {
    let mut server = MockServer::answering("WANT? thumbnail 42\n").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = conn.get_task("images").await.unwrap().unwrap();

    assert_eq!(task.origin(), Some("images"));
    assert_eq!(server.next_line().await, (0, "ASK images".to_string()));
}

#[tokio::test]
async fn test_json_mode_decodes_payload() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Resize {
        file: String,
        width: u32,
    }

    let server = MockServer::answering(r#"WANT? {"file":"cat.png","width":640}"#).await;
    let conn = Connection::connect(server.config().json_mode(true).build())
        .await
        .unwrap();

    let task = conn.get_task("").await.unwrap().unwrap();

    assert_eq!(
        task.data(),
        &TaskData::Json(json!({"file": "cat.png", "width": 640}))
    );
    assert_eq!(
        task.parse::<Resize>().unwrap(),
        Resize {
            file: "cat.png".to_string(),
            width: 640
        }
    );
}

#[tokio::test]
async fn test_json_mode_invalid_payload_is_no_task() {
    let server = MockServer::answering("WANT? this is not json").await;
    let conn = Connection::connect(server.config().json_mode(true).build())
        .await
        .unwrap();

    assert!(conn.get_task("").await.unwrap().is_none());
}

#[tokio::test]
async fn test_schedule_task_wire_format() {
    let mut server = MockServer::answering("NOPE").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let conn = assert_ok!(conn.schedule_task("send newsletter", None).await);
    assert_eq!(server.next_line().await.1, "SCHED send newsletter");

    let conn = assert_ok!(conn.schedule_task(json!({"to": "all"}), None).await);
    assert_eq!(server.next_line().await.1, r#"SCHED {"to":"all"}"#);

    let conn = assert_ok!(conn.schedule_task("resize", Some("images")).await);
    assert_eq!(server.next_line().await.1, "SCHED resize@images");

    assert!(conn.is_active());
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_json_mode_rejects_text_before_sending() {
    let mut server = MockServer::answering("NOPE").await;
    let conn = Connection::connect(server.config().json_mode(true).build())
        .await
        .unwrap();

    let err = assert_err!(conn.schedule_task("not an object", None).await);
    assert!(matches!(err, TaskqError::Validation(_)));

    // the next line the server sees is the close, not a SCHED
    conn.close().await;
    assert_eq!(server.next_line().await, (0, "END".to_string()));
}

#[tokio::test]
async fn test_inactive_connection_reconnects_once() {
    let mut server = MockServer::answering("WANT? after reconnect").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();
    let closed = conn.close().await;
    assert_eq!(server.next_line().await, (0, "END".to_string()));

    let task = closed.get_task("").await.unwrap().unwrap();

    assert_eq!(server.accepted(), 2);
    assert!(task.parent().is_active());
    assert_ne!(task.parent().session_id(), closed.session_id());
    assert_eq!(server.next_line().await, (1, "ASK ".to_string()));

    let closed = task.parent().close().await;
    let conn = closed.schedule_task("again", None).await.unwrap();
    assert_eq!(server.accepted(), 3);
    assert!(conn.is_active());
}

#[tokio::test]
async fn test_get_task_masks_one_transport_failure() {
    let mut server = MockServer::start(|index, line| match (index, line) {
        (0, l) if l.starts_with("ASK") => Action::HangUp,
        (_, l) if l.starts_with("ASK") => Action::Reply("WANT? survived".to_string()),
        _ => Action::Ignore,
    })
    .await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = assert_ok!(conn.get_task("").await).expect("a task");

    assert_eq!(task.data().as_text(), Some("survived"));
    assert_eq!(server.accepted(), 2);
    assert_eq!(server.next_line().await, (0, "ASK ".to_string()));
    assert_eq!(server.next_line().await, (1, "ASK ".to_string()));
}

#[tokio::test]
async fn test_get_task_fails_when_retry_fails() {
    let server = MockServer::start(|_, _| Action::HangUp).await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let err = assert_err!(conn.get_task("").await);

    assert!(matches!(err, TaskqError::Transport(_)));
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn test_schedule_task_masks_one_transport_failure() {
    let mut server = MockServer::start(|index, _| {
        if index == 0 {
            Action::HangUp
        } else {
            Action::Ignore
        }
    })
    .await;
    let conn = Connection::connect(server.config().schedule_grace_ms(300).build())
        .await
        .unwrap();

    let rescheduled = assert_ok!(conn.schedule_task("payload", None).await);

    assert_ne!(rescheduled.session_id(), conn.session_id());
    assert_eq!(server.next_line().await, (0, "SCHED payload".to_string()));
    assert_eq!(server.next_line().await, (1, "SCHED payload".to_string()));
}

#[tokio::test]
async fn test_schedule_task_fails_when_retry_fails() {
    let server = MockServer::start(|_, _| Action::HangUp).await;
    let conn = Connection::connect(server.config().schedule_grace_ms(300).build())
        .await
        .unwrap();

    let err = assert_err!(conn.schedule_task("payload", None).await);
    assert!(matches!(err, TaskqError::Transport(_)));
}

#[tokio::test]
async fn test_get_task_times_out() {
    let server = MockServer::start(|_, _| Action::Ignore).await;
    let conn = Connection::connect(server.config().response_timeout_ms(100).build())
        .await
        .unwrap();

    let err = assert_err!(conn.get_task("").await);
    assert!(matches!(err, TaskqError::Timeout(100)));
}

#[tokio::test]
async fn test_concurrent_ask_is_rejected() {
    let server = MockServer::start(|_, _| Action::Ignore).await;
    let conn = Connection::connect(server.config().response_timeout_ms(200).build())
        .await
        .unwrap();

    let (first, second) = tokio::join!(conn.get_task(""), conn.get_task(""));

    assert!(matches!(first, Err(TaskqError::Timeout(200))));
    assert!(matches!(second, Err(TaskqError::Busy)));
}

#[tokio::test]
async fn test_overdue_reply_never_answers_a_later_ask() {
    let mut server = MockServer::start(|_, line| match line {
        "ASK slow" => Action::Later(Duration::from_millis(150), "WANT? for slow\n".to_string()),
        "ASK fast" => Action::Later(Duration::from_millis(100), "WANT? for fast\n".to_string()),
        _ => Action::Ignore,
    })
    .await;
    let conn = Connection::connect(server.config().response_timeout_ms(400).build())
        .await
        .unwrap();
    let hurried = Connection::connect(server.config().response_timeout_ms(100).build())
        .await
        .unwrap();

    let err = assert_err!(hurried.get_task("slow").await);
    assert!(matches!(err, TaskqError::Timeout(100)));

    // the timed-out session is dropped, so the ask goes out on a fresh one
    let task = assert_ok!(hurried.get_task("fast").await).expect("a task");
    assert_eq!(task.data().as_text(), Some("for fast"));
    assert_ne!(task.parent().session_id(), hurried.session_id());

    let task = conn.get_task("slow").await.unwrap().unwrap();
    assert_eq!(task.data().as_text(), Some("for slow"));

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(server.next_line().await.1);
    }
    assert_eq!(seen, vec!["ASK slow", "ASK fast", "ASK slow"]);
}

#[tokio::test]
async fn test_large_payload_is_delivered_whole() {
    let payload = "x".repeat(20_000);
    let reply = format!("WANT? {}\n", payload);
    let server = MockServer::start(move |_, line| {
        if line.starts_with("ASK") {
            Action::Reply(reply.clone())
        } else {
            Action::Ignore
        }
    })
    .await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = assert_ok!(conn.get_task("").await).expect("a task");

    assert_eq!(task.data().as_text().map(str::len), Some(20_000));
    assert_eq!(task.data().as_text(), Some(payload.as_str()));
}

#[tokio::test]
async fn test_large_json_payload_is_delivered_whole() {
    let items: Vec<u32> = (0..5_000).collect();
    let reply = format!("WANT? {}\n", json!({ "items": items }));
    let server = MockServer::start(move |_, line| {
        if line.starts_with("ASK") {
            Action::Reply(reply.clone())
        } else {
            Action::Ignore
        }
    })
    .await;
    let conn = Connection::connect(server.config().json_mode(true).build())
        .await
        .unwrap();

    let task = conn.get_task("").await.unwrap().expect("a task");

    assert_eq!(task.data(), &TaskData::Json(json!({ "items": items })));
}

#[tokio::test]
async fn test_reply_split_across_writes() {
    let server = MockServer::start(|_, line| {
        if line.starts_with("ASK") {
            Action::Pieces(vec!["WANT? par".to_string(), "tail\n".to_string()])
        } else {
            Action::Ignore
        }
    })
    .await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = assert_ok!(conn.get_task("").await).expect("a task");
    assert_eq!(task.data().as_text(), Some("partail"));

    // nothing of the first reply is left over for the next exchange
    let task = conn.get_task("").await.unwrap().unwrap();
    assert_eq!(task.data().as_text(), Some("partail"));
}

#[tokio::test]
async fn test_lifecycle_commands() {
    let mut server = MockServer::answering("WANT? job").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    conn.get_task("").await.unwrap().unwrap().accept().await;
    conn.get_task("").await.unwrap().unwrap().decline().await;
    conn.get_task("").await.unwrap().unwrap().delete().await;
    conn.accept_last_task().await;

    let received: Vec<String> = {
        let mut lines = Vec::new();
        for _ in 0..7 {
            lines.push(server.next_line().await.1);
        }
        lines
    };
    assert_eq!(
        received,
        vec!["ASK ", "ACK", "ASK ", "DCL", "ASK ", "DEL", "ACK"]
    );
}

#[tokio::test]
async fn test_lifecycle_error_callback() {
    let server = MockServer::start(|_, line| match line {
        "ACK" => Action::HangUp,
        _ => Action::Reply("WANT? job".to_string()),
    })
    .await;
    let conn = Connection::connect(server.config().build()).await.unwrap();
    let task = conn.get_task("").await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    task.accept_with(move |err| {
        let _ = tx.send(err);
    })
    .await;

    let err = timeout(Duration::from_secs(2), rx)
        .await
        .expect("callback never ran")
        .unwrap();
    assert!(matches!(err, TaskqError::Transport(_)));
}

#[tokio::test]
async fn test_lifecycle_on_failed_connection_reports_immediately() {
    let server = MockServer::start(|_, _| Action::HangUp).await;
    let conn = Connection::connect(server.config().build()).await.unwrap();
    let _ = conn.get_task("").await;

    // conn's own transport was hung up on by the first ASK
    let (tx, rx) = oneshot::channel();
    conn.decline_last_task_with(move |err| {
        let _ = tx.send(err);
    })
    .await;

    assert!(matches!(rx.await.unwrap(), TaskqError::Transport(_)));
}

#[tokio::test]
async fn test_reschedule_returns_task_to_origin() {
    let mut server = MockServer::answering("WANT? thumbnail 42").await;
    let conn = Connection::connect(server.config().build()).await.unwrap();

    let task = conn.get_task("images").await.unwrap().unwrap();
    let conn = assert_ok!(task.reschedule().await);

    assert!(conn.is_active());
    assert_eq!(server.next_line().await.1, "ASK images");
    assert_eq!(server.next_line().await.1, "SCHED thumbnail 42@images");

    let task = conn.get_task("").await.unwrap().unwrap();
    assert_ok!(task.reschedule().await);
    assert_eq!(server.next_line().await.1, "ASK ");
    assert_eq!(server.next_line().await.1, "SCHED thumbnail 42");
}

#[tokio::test]
async fn test_reschedule_in_json_mode() {
    let mut server = MockServer::answering(r#"WANT? {"n":1}"#).await;
    let conn = Connection::connect(server.config().json_mode(true).build())
        .await
        .unwrap();

    let task = conn.get_task("").await.unwrap().unwrap();
    assert_ok!(task.reschedule().await);

    assert_eq!(server.next_line().await.1, "ASK ");
    assert_eq!(server.next_line().await.1, r#"SCHED {"n":1}"#);
}
