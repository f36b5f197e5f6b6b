//! Wire codec for the queue's line protocol.
//!
//! ## Commands
//!
//! ```text
//! ASK [queue]              request the next task
//! SCHED <payload>[@queue]  enqueue a task
//! ACK | DCL | DEL          finalize the last delivered task
//! END                      close the session
//! ```
//!
//! ## Replies
//!
//! Only `ASK` is answered. `WANT? <payload>` carries a task; anything else
//! (the server sends `NOPE`) means no task was available. Replies carry no
//! request identifier, so the caller must keep a single exchange in flight.

use crate::error::{Result, TaskqError};
use crate::task::TaskData;

/// Prefix that marks a reply carrying a task.
pub const REPLY_PREFIX: &str = "WANT? ";

/// How outgoing commands are terminated.
///
/// Older server deployments read unterminated commands straight off the
/// socket; current ones split on `\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    None,
    #[default]
    Newline,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::None => "",
            LineEnding::Newline => "\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask { queue: Option<String> },
    Sched { payload: String, queue: Option<String> },
    Ack,
    Dcl,
    Del,
    End,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ask { .. } => "ASK",
            Command::Sched { .. } => "SCHED",
            Command::Ack => "ACK",
            Command::Dcl => "DCL",
            Command::Del => "DEL",
            Command::End => "END",
        }
    }

    /// Whether the server answers this command.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::Ask { .. })
    }
}

/// Encode a command as a single protocol line.
pub fn encode(command: &Command, line_ending: LineEnding) -> String {
    let body = match command {
        Command::Ask { queue } => format!("ASK {}", queue.as_deref().unwrap_or("")),
        Command::Sched {
            payload,
            queue: Some(queue),
        } => format!("SCHED {}@{}", payload, queue),
        Command::Sched {
            payload,
            queue: None,
        } => format!("SCHED {}", payload),
        other => other.name().to_string(),
    };

    body + line_ending.as_str()
}

/// Decode a reply chunk into the delivered task, if any.
///
/// Returns `None` for anything that is not a `WANT?` reply, for an empty
/// payload, and in JSON mode for a payload that does not parse.
pub fn parse_reply(reply: &[u8], json_mode: bool) -> Option<TaskData> {
    let text = String::from_utf8_lossy(reply);
    let start = text.find(REPLY_PREFIX)? + REPLY_PREFIX.len();
    let rest = &text[start..];
    let payload = match rest.find(['\r', '\n']) {
        Some(end) => &rest[..end],
        None => rest,
    };

    if payload.is_empty() {
        return None;
    }

    if json_mode {
        serde_json::from_str(payload).ok().map(TaskData::Json)
    } else {
        Some(TaskData::Text(payload.to_string()))
    }
}

/// Queue names are plain ASCII letters; anything else would be read by the
/// server as part of the payload or as a second command.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(TaskqError::Validation(format!(
            "Queue name must match [A-Za-z]+, got {:?}",
            name
        )));
    }
    Ok(())
}

/// A payload must fit on one line.
pub fn validate_payload(payload: &str) -> Result<()> {
    if payload.contains(['\r', '\n']) {
        return Err(TaskqError::Validation(
            "Task payload must not contain line breaks".to_string(),
        ));
    }
    Ok(())
}
