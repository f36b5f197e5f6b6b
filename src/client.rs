use crate::{
    config::{Config, ConfigBuilder},
    error::{Result, TaskqError},
    link::{ErrorHook, Event, Link},
    protocol::{encode, parse_reply, validate_payload, validate_queue_name, Command},
    retry::{Attempt, RetryStrategy},
    task::{Task, TaskData},
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// A session with a task queue server.
///
/// `Connection` is a cheap, clonable value. Operations never change a
/// connection in place: [`close`](Self::close) and the request operations
/// hand back a new value, and callers keep using the latest one. A value
/// that is no longer [active](Self::is_active) is transparently replaced by a
/// fresh session to the same server the next time it is used for a request.
///
/// The protocol has no request identifiers, so a connection carries one
/// exchange at a time. Starting a second [`get_task`](Self::get_task) while
/// one is still waiting for its reply fails with [`TaskqError::Busy`], and a
/// session whose reply timed out is never used for another exchange.
///
/// # Examples
///
/// ```no_run
/// use taskq_client::Connection;
///
/// #[tokio::main]
/// async fn main() -> Result<(), taskq_client::TaskqError> {
///     let conn = Connection::open("localhost", 1337, false).await?;
///
///     let conn = conn.schedule_task("resize cat.png", Some("images")).await?;
///
///     if let Some(task) = conn.get_task("images").await? {
///         println!("working on {:?}", task.data());
///         task.accept().await;
///     }
///
///     conn.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Connection {
    config: Arc<Config>,
    link: Arc<Link>,
    active: bool,
}

impl Connection {
    /// Connects to a server with default timeouts.
    ///
    /// # Arguments
    ///
    /// * `host` - The hostname or IP address of the queue server
    /// * `port` - The port number of the queue server
    /// * `json_mode` - When `true`, only JSON objects are accepted and returned as tasks
    ///
    /// # Errors
    ///
    /// Returns [`TaskqError::Connection`] if the server is unreachable, refuses
    /// the connection, or does not complete the handshake in time.
    pub async fn open(host: impl Into<String>, port: u16, json_mode: bool) -> Result<Self> {
        let config = ConfigBuilder::new()
            .host(host)
            .port(port)
            .json_mode(json_mode)
            .build();
        Self::connect(config).await
    }

    /// Connects to the server described by `config`.
    ///
    /// ```no_run
    /// use taskq_client::Connection;
    ///
    /// # async fn example() -> Result<(), taskq_client::TaskqError> {
    /// let conn = Connection::connect(
    ///     Connection::builder()
    ///         .host("queue.internal")
    ///         .port(8080)
    ///         .json_mode(true)
    ///         .response_timeout_ms(2000)
    ///         .build(),
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: Config) -> Result<Self> {
        Self::establish(Arc::new(config)).await
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    async fn establish(config: Arc<Config>) -> Result<Self> {
        let address = config.address();
        let link = Link::connect(&address, config.connect_timeout).await?;
        debug!(session = %link.id(), %address, json_mode = config.json_mode, "connected");

        Ok(Self {
            config,
            link: Arc::new(link),
            active: true,
        })
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn json_mode(&self) -> bool {
        self.config.json_mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `true` from a successful handshake until [`close`](Self::close).
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Identifies the underlying transport session; changes on reconnect.
    pub fn session_id(&self) -> Uuid {
        self.link.id()
    }

    /// Ends the session by sending `END`.
    ///
    /// The server does not acknowledge `END`, so this returns as soon as the
    /// command is written. The returned value is inactive; a later request
    /// through it opens a new session.
    pub async fn close(&self) -> Connection {
        if let Err(e) = self.send(&Command::End).await {
            warn!(session = %self.link.id(), error = %e, "END could not be written");
        }

        Connection {
            active: false,
            ..self.clone()
        }
    }

    /// Asks the server for a task.
    ///
    /// `from` names the queue to draw from; an empty string asks the
    /// server's default queue. A named queue is recorded as the task's
    /// [`origin`](Task::origin).
    ///
    /// A transport failure is masked once: the request is repeated on a fresh
    /// connection, and the outcome of that second attempt is final. The
    /// delivered task's [`parent`](Task::parent) is whichever connection
    /// carried the reply.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(task))` if the server delivered a task
    /// * `Ok(None)` if no task was available, or in JSON mode if the payload
    ///   was not valid JSON
    ///
    /// # Errors
    ///
    /// * [`TaskqError::Validation`] if `from` is not empty and not `[A-Za-z]+`
    /// * [`TaskqError::Connection`] if reconnecting fails
    /// * [`TaskqError::Transport`] if the retry fails too
    /// * [`TaskqError::Timeout`] if no reply arrives within the response timeout;
    ///   the session is then abandoned and the next request on this value
    ///   reconnects
    /// * [`TaskqError::Busy`] if another exchange is awaiting its reply
    pub async fn get_task(&self, from: &str) -> Result<Option<Task>> {
        let queue = if from.is_empty() {
            None
        } else {
            validate_queue_name(from)?;
            Some(from.to_string())
        };

        RetryStrategy::new(self.config.retry_delay)
            .execute(|attempt| {
                let queue = queue.clone();
                async move { self.ask_once(queue, attempt).await }
            })
            .await
    }

    async fn ask_once(&self, queue: Option<String>, attempt: Attempt) -> Result<Option<Task>> {
        let conn = self.ready_for(attempt).await?;

        let reply = conn.link.bind_reply()?;
        conn.send(&Command::Ask {
            queue: queue.clone(),
        })
        .await?;

        let limit = conn.config.response_timeout;
        let event = match timeout(limit, reply).await {
            Ok(received) => received
                .map_err(|_| TaskqError::Transport("transport closed before replying".to_string()))?,
            Err(_) => {
                let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                // the overdue reply may still arrive and would answer the next ASK
                conn.link
                    .abandon(&format!("no reply within {}ms", millis))
                    .await;
                return Err(TaskqError::Timeout(millis));
            }
        };

        match event {
            Event::Data(bytes) => {
                let data = parse_reply(&bytes, conn.json_mode());
                debug!(session = %conn.link.id(), delivered = data.is_some(), "reply");
                Ok(data.map(|data| Task::new(conn, data, queue)))
            }
            Event::Error(reason) => Err(TaskqError::Transport(reason)),
        }
    }

    /// Enqueues a task, waiting the configured grace period for errors.
    ///
    /// See [`schedule_task_with_grace`](Self::schedule_task_with_grace).
    pub async fn schedule_task(
        &self,
        task: impl Into<TaskData>,
        for_queue: Option<&str>,
    ) -> Result<Connection> {
        self.schedule_task_with_grace(task, for_queue, self.config.schedule_grace)
            .await
    }

    /// Enqueues a task, optionally on a named queue.
    ///
    /// The server never confirms `SCHED`. After writing, this listens for a
    /// transport error for `grace`; if none arrives the task is assumed to be
    /// scheduled. A success therefore means the task was sent, not that the
    /// server stored it.
    ///
    /// A transport failure is masked once by rescheduling on a fresh
    /// connection. Keep using the returned connection afterwards.
    ///
    /// # Errors
    ///
    /// * [`TaskqError::Validation`] in JSON mode when `task` is not a JSON
    ///   object or array, when a text payload spans lines, or when
    ///   `for_queue` is not `[A-Za-z]+`; raised before anything is sent
    /// * [`TaskqError::Connection`] if reconnecting fails
    /// * [`TaskqError::Transport`] if the retry fails too
    pub async fn schedule_task_with_grace(
        &self,
        task: impl Into<TaskData>,
        for_queue: Option<&str>,
        grace: Duration,
    ) -> Result<Connection> {
        let task = task.into();
        if self.json_mode() && !task.is_object() {
            return Err(TaskqError::Validation(
                "Task has to be an object when using JSON mode".to_string(),
            ));
        }

        let payload = task.to_payload()?;
        validate_payload(&payload)?;
        let queue = match for_queue.filter(|q| !q.is_empty()) {
            Some(q) => {
                validate_queue_name(q)?;
                Some(q.to_string())
            }
            None => None,
        };
        let command = Command::Sched { payload, queue };

        RetryStrategy::new(self.config.retry_delay)
            .execute(|attempt| {
                let command = command.clone();
                async move { self.schedule_once(command, grace, attempt).await }
            })
            .await
    }

    async fn schedule_once(
        &self,
        command: Command,
        grace: Duration,
        attempt: Attempt,
    ) -> Result<Connection> {
        let conn = self.ready_for(attempt).await?;

        let errors = conn.link.bind_errors()?;
        conn.send(&command).await?;

        match timeout(grace, errors).await {
            Ok(Ok(Event::Error(reason))) => Err(TaskqError::Transport(reason)),
            // silence for the whole grace period counts as success
            _ => Ok(conn),
        }
    }

    /// Marks the last task received on this connection as accepted.
    ///
    /// The server applies `ACK` to whatever task it delivered last; the
    /// command carries no identifier and is never confirmed. Transport
    /// errors are only logged. Use
    /// [`accept_last_task_with`](Self::accept_last_task_with) to react to them.
    pub async fn accept_last_task(&self) {
        self.finalize(Command::Ack, None).await
    }

    /// Like [`accept_last_task`](Self::accept_last_task), calling `on_error`
    /// if the transport fails before a later reply shows the `ACK` went through.
    pub async fn accept_last_task_with<F>(&self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.finalize(Command::Ack, Some(Box::new(on_error))).await
    }

    /// Marks the last task received as declined, returning it to the queue.
    pub async fn decline_last_task(&self) {
        self.finalize(Command::Dcl, None).await
    }

    /// Declines the last task; `on_error` runs if the transport fails, which
    /// is the caller's cue to reschedule the task by hand.
    pub async fn decline_last_task_with<F>(&self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.finalize(Command::Dcl, Some(Box::new(on_error))).await
    }

    /// Marks the last task received as deleted.
    pub async fn delete_last_task(&self) {
        self.finalize(Command::Del, None).await
    }

    pub async fn delete_last_task_with<F>(&self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.finalize(Command::Del, Some(Box::new(on_error))).await
    }

    async fn finalize(
        &self,
        command: Command,
        on_error: Option<Box<dyn FnOnce(TaskqError) + Send + 'static>>,
    ) {
        let session = self.link.id();
        let name = command.name();
        let hook: ErrorHook = Box::new(move |reason| {
            warn!(%session, command = name, %reason, "finalizing command may be lost");
            if let Some(on_error) = on_error {
                on_error(TaskqError::Transport(reason));
            }
        });
        self.link.watch_errors(hook);

        // failures have already been reported through the hook
        let _ = self.send(&command).await;
    }

    async fn ready_for(&self, attempt: Attempt) -> Result<Connection> {
        if self.active && !attempt.is_retry() {
            return Ok(self.clone());
        }

        debug!(
            stale_session = %self.link.id(),
            retry = attempt.is_retry(),
            "opening a fresh session"
        );
        Self::establish(Arc::clone(&self.config)).await
    }

    async fn send(&self, command: &Command) -> Result<()> {
        let line = encode(command, self.config.line_ending);
        debug!(session = %self.link.id(), command = command.name(), "sending");
        self.link.send(&line).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("json_mode", &self.config.json_mode)
            .field("active", &self.active)
            .field("session", &self.link.id())
            .field("faulted", &self.link.is_faulted())
            .finish()
    }
}
