//! Pipelined, auto-reconnecting RESP (Redis protocol) client for tokio.
//!
//! One [`RedisClient`] drives one TCP connection through a full lifecycle:
//! exponential-backoff reconnection with a bounded budget, an offline queue
//! replayed on ready, strict FIFO reply matching over a pipelined wire,
//! a pub/sub overlay whose subscriptions survive reconnects, and a corking
//! batcher that coalesces writes.
//!
//! ```no_run
//! use rewire::{ClientConfig, RedisClient};
//!
//! # async fn demo() -> rewire::Result<()> {
//! let client = RedisClient::connect(ClientConfig::default());
//! client
//!     .send_command("set", vec!["greeting".into(), "hello".into()])
//!     .await?;
//! let reply = client.send_command("get", vec!["greeting".into()]).await?;
//! assert_eq!(reply.as_str(), Some("hello"));
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
mod connection;
mod dispatch;
pub mod error;
pub mod events;
pub mod info;
mod monitor;
mod pubsub;
mod queue;
pub mod resp;
mod writer;

pub use client::{CommandFuture, RedisClient};
pub use command::{CommandArg, ReplyMode};
pub use config::{ClientConfig, RetryContext, RetryDecision};
pub use error::{AbortCode, ClientError, Result};
pub use events::ClientEvent;
pub use info::ServerInfo;
pub use resp::types::RespValue;
