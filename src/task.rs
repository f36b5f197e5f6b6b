use crate::client::Connection;
use crate::error::{Result, TaskqError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// The payload of a task.
///
/// Text-mode connections exchange raw single-line strings. JSON-mode
/// connections exchange JSON documents; only objects and arrays may be sent.
///
/// # Examples
///
/// ```
/// use taskq_client::TaskData;
/// use serde_json::json;
///
/// let text = TaskData::from("resize cat.png");
/// assert_eq!(text.to_payload().unwrap(), "resize cat.png");
///
/// let job = TaskData::from(json!({"job": "resize", "width": 640}));
/// assert!(job.is_object());
/// assert_eq!(job.to_payload().unwrap(), r#"{"job":"resize","width":640}"#);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum TaskData {
    Text(String),
    Json(Value),
}

impl TaskData {
    /// Serializes any `serde` value into a JSON task payload.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(TaskData::Json(serde_json::to_value(value)?))
    }

    /// Whether the payload is acceptable on a JSON-mode connection.
    pub fn is_object(&self) -> bool {
        matches!(self, TaskData::Json(Value::Object(_) | Value::Array(_)))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskData::Text(text) => Some(text),
            TaskData::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            TaskData::Json(value) => Some(value),
            TaskData::Text(_) => None,
        }
    }

    /// Renders the payload as it goes on the wire.
    pub fn to_payload(&self) -> Result<String> {
        match self {
            TaskData::Text(text) => Ok(text.clone()),
            TaskData::Json(value) => Ok(serde_json::to_string(value)?),
        }
    }
}

impl From<&str> for TaskData {
    fn from(text: &str) -> Self {
        TaskData::Text(text.to_string())
    }
}

impl From<String> for TaskData {
    fn from(text: String) -> Self {
        TaskData::Text(text)
    }
}

impl From<Value> for TaskData {
    fn from(value: Value) -> Self {
        TaskData::Json(value)
    }
}

/// A unit of work handed out by the server.
///
/// The server finalizes tasks by position: `ACK`, `DCL` and `DEL` apply to
/// whatever task it last delivered on the connection. The finalizing methods
/// here therefore consume the task, and should be called before the next
/// [`Connection::get_task`] on the same connection.
#[derive(Debug)]
pub struct Task {
    parent: Connection,
    data: TaskData,
    origin: Option<String>,
}

impl Task {
    pub(crate) fn new(parent: Connection, data: TaskData, origin: Option<String>) -> Self {
        Self {
            parent,
            data,
            origin,
        }
    }

    pub fn data(&self) -> &TaskData {
        &self.data
    }

    pub fn into_data(self) -> TaskData {
        self.data
    }

    /// The queue the task was requested from, if one was named.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The connection that delivered the task.
    pub fn parent(&self) -> &Connection {
        &self.parent
    }

    /// Deserializes the payload into a typed value.
    ///
    /// JSON payloads are converted directly; text payloads are parsed as JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            TaskData::Json(value) => serde_json::from_value(value.clone()).map_err(Into::into),
            TaskData::Text(text) => serde_json::from_str(text).map_err(Into::into),
        }
    }

    pub async fn accept(self) {
        self.parent.accept_last_task().await
    }

    pub async fn accept_with<F>(self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.parent.accept_last_task_with(on_error).await
    }

    pub async fn decline(self) {
        self.parent.decline_last_task().await
    }

    pub async fn decline_with<F>(self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.parent.decline_last_task_with(on_error).await
    }

    pub async fn delete(self) {
        self.parent.delete_last_task().await
    }

    pub async fn delete_with<F>(self, on_error: F)
    where
        F: FnOnce(TaskqError) + Send + 'static,
    {
        self.parent.delete_last_task_with(on_error).await
    }

    /// Submits the payload again, to the queue it came from.
    ///
    /// This does not decline the task; the server still considers it the
    /// last delivered one until it is finalized.
    pub async fn reschedule(self) -> Result<Connection> {
        let Task {
            parent,
            data,
            origin,
        } = self;
        parent.schedule_task(data, origin.as_deref()).await
    }
}
