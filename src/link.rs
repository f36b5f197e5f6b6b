//! Transport link and one-shot event binding.
//!
//! A [`Link`] owns one transport session. A background reader task turns the
//! inbound byte stream into two kinds of events, "bytes arrived" and
//! "transport failed", and hands each one to the listeners bound for it.
//! Every listener fires at most once and is detached as it fires.
//!
//! At most one listener may wait for reply bytes at a time. The protocol
//! carries no request identifiers, so a second reply listener could only be
//! matched to a reply by arrival order; binding one while another is pending
//! is rejected with [`TaskqError::Busy`].
//!
//! Replies are framed on `\n`: each complete line is one reply, however many
//! reads it took to arrive. Bytes without a terminator are held until the
//! stream goes quiet for [`UNTERMINATED_REPLY_WAIT`], then delivered as one
//! reply, which keeps servers that never terminate their replies working.

use crate::error::{Result, TaskqError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 8192;

/// How long an unterminated tail may sit before it is taken as a whole reply.
pub const UNTERMINATED_REPLY_WAIT: Duration = Duration::from_millis(50);

/// What a bound listener is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data(Vec<u8>),
    Error(String),
}

/// Callback fired with the failure reason when the transport errors.
pub type ErrorHook = Box<dyn FnOnce(String) + Send + 'static>;

enum Notify {
    Channel(oneshot::Sender<Event>),
    Hook(ErrorHook),
}

struct Listener {
    seq: u64,
    wants_data: bool,
    notify: Notify,
}

impl Listener {
    fn is_abandoned(&self) -> bool {
        match &self.notify {
            Notify::Channel(tx) => tx.is_closed(),
            Notify::Hook(_) => false,
        }
    }
}

#[derive(Default)]
struct Listeners {
    next_seq: u64,
    entries: Vec<Listener>,
    fault: Option<String>,
}

struct Shared {
    id: Uuid,
    listeners: Mutex<Listeners>,
}

impl Shared {
    fn bind(&self, wants_data: bool) -> Result<oneshot::Receiver<Event>> {
        let (tx, rx) = oneshot::channel();
        let mut listeners = self.listeners.lock();

        // receivers dropped on timeout leave their slot behind
        listeners.entries.retain(|l| !l.is_abandoned());

        if let Some(reason) = listeners.fault.clone() {
            let _ = tx.send(Event::Error(reason));
            return Ok(rx);
        }

        if wants_data && listeners.entries.iter().any(|l| l.wants_data) {
            return Err(TaskqError::Busy);
        }

        let seq = listeners.next_seq;
        listeners.next_seq += 1;
        listeners.entries.push(Listener {
            seq,
            wants_data,
            notify: Notify::Channel(tx),
        });
        Ok(rx)
    }

    fn watch(&self, hook: ErrorHook) {
        let mut listeners = self.listeners.lock();
        if let Some(reason) = listeners.fault.clone() {
            drop(listeners);
            hook(reason);
            return;
        }

        let seq = listeners.next_seq;
        listeners.next_seq += 1;
        listeners.entries.push(Listener {
            seq,
            wants_data: false,
            notify: Notify::Hook(hook),
        });
    }

    fn deliver(&self, bytes: &[u8]) {
        let mut listeners = self.listeners.lock();
        listeners.entries.retain(|l| !l.is_abandoned());

        let Some(pos) = listeners.entries.iter().position(|l| l.wants_data) else {
            debug!(session = %self.id, len = bytes.len(), "discarding unsolicited bytes");
            return;
        };
        let reply = listeners.entries.remove(pos);

        // A reply proves every command written before the ask reached the
        // server, so watchers registered earlier can no longer fire usefully.
        listeners
            .entries
            .retain(|l| !(matches!(l.notify, Notify::Hook(_)) && l.seq < reply.seq));
        drop(listeners);

        if let Notify::Channel(tx) = reply.notify {
            let _ = tx.send(Event::Data(bytes.to_vec()));
        }
    }

    fn fail(&self, reason: String) {
        let mut listeners = self.listeners.lock();
        if listeners.fault.is_some() {
            return;
        }
        listeners.fault = Some(reason.clone());
        let entries = std::mem::take(&mut listeners.entries);
        drop(listeners);

        warn!(session = %self.id, %reason, listeners = entries.len(), "transport failed");
        for listener in entries {
            match listener.notify {
                Notify::Channel(tx) => {
                    let _ = tx.send(Event::Error(reason.clone()));
                }
                Notify::Hook(hook) => hook(reason.clone()),
            }
        }
    }

    fn fault(&self) -> Option<String> {
        self.listeners.lock().fault.clone()
    }
}

/// One transport session: a write half and a reader task feeding listeners.
pub struct Link {
    shared: Arc<Shared>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    reader: JoinHandle<()>,
}

impl Link {
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                TaskqError::Connection(format!(
                    "no handshake with {} after {}ms",
                    address,
                    connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TaskqError::Connection(e.to_string()))?;

        let (reader, writer) = stream.into_split();
        Ok(Self::spawn(reader, writer))
    }

    /// Starts a link over an already established byte stream.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            id: Uuid::now_v7(),
            listeners: Mutex::new(Listeners::default()),
        });
        let reader = tokio::spawn(pump(reader, Arc::clone(&shared)));

        Self {
            shared,
            writer: AsyncMutex::new(Box::new(writer)),
            reader,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.fault().is_some()
    }

    /// Binds a listener for the next reply or the next failure, whichever
    /// comes first.
    pub fn bind_reply(&self) -> Result<oneshot::Receiver<Event>> {
        self.shared.bind(true)
    }

    /// Binds a listener for the next failure only.
    pub fn bind_errors(&self) -> Result<oneshot::Receiver<Event>> {
        self.shared.bind(false)
    }

    /// Runs `hook` on the next failure, or right away if the link has
    /// already failed.
    pub fn watch_errors(&self, hook: ErrorHook) {
        self.shared.watch(hook);
    }

    /// Gives up on the session: every listener is told `reason`, the reader
    /// stops and the write half is shut down.
    ///
    /// Used when a reply is overdue. The server may still send it, and the
    /// protocol cannot tell that late reply apart from the answer to a later
    /// command, so the transport must not carry another exchange.
    pub async fn abandon(&self, reason: &str) {
        self.shared.fail(reason.to_string());
        self.reader.abort();
        let _ = self.writer.lock().await.shutdown().await;
    }

    /// Writes one encoded command. A failed write fails the whole link.
    pub async fn send(&self, line: &str) -> Result<()> {
        if let Some(reason) = self.shared.fault() {
            return Err(TaskqError::Transport(reason));
        }

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        written.map_err(|e| {
            let reason = e.to_string();
            self.shared.fail(reason.clone());
            TaskqError::Transport(reason)
        })
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn pump<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let read = if pending.is_empty() {
            reader.read(&mut buf).await
        } else {
            match timeout(UNTERMINATED_REPLY_WAIT, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    shared.deliver(&std::mem::take(&mut pending));
                    continue;
                }
            }
        };

        match read {
            Ok(0) => {
                if !pending.is_empty() {
                    shared.deliver(&pending);
                }
                shared.fail("connection closed by peer".to_string());
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    shared.deliver(&line);
                }
            }
            Err(e) => {
                shared.fail(e.to_string());
                break;
            }
        }
    }
}
