//! # taskq client
//!
//! An async client for task queue servers that speak a small line-based
//! protocol over a single TCP connection:
//!
//! ```text
//! ASK [queue]              ->  WANT? <payload>  |  NOPE
//! SCHED <payload>[@queue]
//! ACK | DCL | DEL
//! END
//! ```
//!
//! The protocol has no request identifiers and confirms nothing but `ASK`.
//! This crate keeps exchanges correlated by allowing a single reply in flight
//! per connection, masks one transport failure per request by reconnecting,
//! and validates JSON-mode payloads before anything is sent.
//!
//! ## Quick Start
//!
//! ```no_run
//! use taskq_client::Connection;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::open("localhost", 1337, false).await?;
//!
//!     // Enqueue a task on the default queue
//!     let conn = conn.schedule_task("send newsletter", None).await?;
//!
//!     // Take it back out and finish it
//!     if let Some(task) = conn.get_task("").await? {
//!         println!("Task: {:?}", task.data());
//!         task.accept().await;
//!     }
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Connections are values
//!
//! Operations that change a session's state return a new [`Connection`]
//! rather than mutating the one they were given. [`Connection::close`]
//! returns an inactive value; passing an inactive value to a request
//! operation opens a fresh session to the same server first.
//!
//! ## Delivery guarantees
//!
//! `SCHED` is never acknowledged. [`Connection::schedule_task`] waits a short
//! grace period for a transport error and otherwise assumes success, so a
//! returned `Ok` means "sent", not "stored".
//!
//! ## Configuration
//!
//! ```no_run
//! use taskq_client::{Connection, ConfigBuilder, LineEnding};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), taskq_client::TaskqError> {
//! let conn = Connection::connect(
//!     ConfigBuilder::new()
//!         .host("queue.example.com")
//!         .port(8080)
//!         .json_mode(true)
//!         .response_timeout(Duration::from_secs(2))
//!         .schedule_grace_ms(500)
//!         .line_ending(LineEnding::Newline)
//!         .build(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
mod link;
pub mod protocol;
mod retry;
pub mod task;

pub use client::Connection;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, TaskqError};
pub use protocol::{Command, LineEnding};
pub use task::{Task, TaskData};
