//! Async event socket protocol engine
//!
//! This crate implements the FreeSWITCH-style event socket wire protocol:
//! MIME-like frames carrying command replies, API responses, and
//! asynchronous events over a plain TCP (or any duplex) stream. It covers
//! both connection modes — inbound, where the application dials the switch
//! and authenticates, and outbound, where the switch dials the application
//! with a connection dedicated to one call.
//!
//! # Architecture
//!
//! Each connection runs one background reader task that demultiplexes
//! incoming frames:
//! - command replies and API responses resolve pending commands in FIFO
//!   order, with events freely interleaved in between
//! - `BACKGROUND_JOB` events complete [`BackgroundJob`] handles, correlated
//!   by job id
//! - everything else is dispatched to registered event listeners, off the
//!   read loop so a slow callback never stalls frame ingestion
//!
//! [`Connection`] is Clone + Send; any number of tasks may send commands
//! concurrently.
//!
//! The engine is payload-agnostic: commands are opaque strings and event
//! header values are kept raw, percent-decoded only on access.
//!
//! # Examples
//!
//! ## Inbound Connection
//!
//! ```rust,no_run
//! use event_socket::{inbound, EslError, EventFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let connection = inbound::connect("localhost:8021", "ClueCon").await?;
//!
//!     connection.register_event_listener(EventFilter::All, |event| {
//!         println!("{}: {}", event.name(), event.header("Core-UUID"));
//!     });
//!     connection.send("event plain ALL").await?;
//!
//!     let response = connection.send_recv("api status").await?;
//!     println!("{}", response.body_str().unwrap_or_default());
//!
//!     let job = connection.background_job("originate user/1000 &park").await?;
//!     let completion = job.wait(std::time::Duration::from_secs(30)).await?;
//!     println!("{}", completion.body_str().unwrap_or_default());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Outbound Mode
//!
//! The switch connects to *your* application; each accepted connection is
//! scoped to one call, described by the channel-data event:
//!
//! ```rust,no_run
//! use event_socket::{EslError, OutboundListener};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let listener = OutboundListener::bind("0.0.0.0:8040").await?;
//!     loop {
//!         let (connection, channel_data) = listener.accept().await?;
//!         tokio::spawn(async move {
//!             let unique_id = channel_data.header("Unique-ID");
//!             println!("call from {}", channel_data.header("Caller-Caller-ID-Number"));
//!             let _ = connection.send_recv(&format!("api uuid_answer {unique_id}")).await;
//!         });
//!     }
//! }
//! ```

mod command;
pub mod constants;
mod connection;
mod correlator;
mod error;
mod event;
mod frame;
pub mod inbound;
mod logger;
pub mod outbound;
mod registry;

pub use connection::{
    BackgroundJob, Connection, ConnectionOptions, ConnectionStatus, DisconnectReason, Transport,
};
pub use error::{EslError, EslResult, FrameError, FrameErrorKind};
pub use event::{Event, EventHeaders};
pub use frame::{json_event, parse_event_body, read_frame};
pub use logger::{LogSink, Logger};
pub use outbound::OutboundListener;
pub use registry::{EventFilter, EventListener, ListenerId};
