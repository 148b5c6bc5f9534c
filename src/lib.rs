//! Multi-worker, non-blocking I/O reactor core with a UUID-addressed fd
//! table, a deferred task queue, and a clustered pub/sub layer.
//!
//! Grounded on `tokio-rs-mio`'s split between a bare OS-poll layer
//! (`sys`, [`poll`]) and the richer abstractions built on top of it, this
//! crate folds in the fd lifecycle ([`fd_table`], [`packet`]), protocol
//! locking ([`lock`]), deferred work ([`defer`]), lifecycle callbacks
//! ([`lifecycle`]), and - behind the `cluster` feature - a parent/worker
//! pub/sub fan-out ([`cluster`], [`pubsub`]).
//!
//! A minimal echo server:
//!
//! ```no_run
//! use reactium::{Protocol, ReactorConfig, Runtime};
//! use std::sync::Arc;
//!
//! struct Echo;
//! impl Protocol for Echo {
//!     fn on_data(&self, conn: &reactium::Connection) {
//!         // read hooks would normally be invoked from a real `RwHooks`
//!         // implementation; protocols call back into `conn` to write.
//!         let _ = conn.touch();
//!     }
//! }
//!
//! let runtime = Runtime::init(ReactorConfig::new()).unwrap();
//! let _listener = runtime.listen(
//!     "127.0.0.1:0".parse().unwrap(),
//!     || Arc::new(Echo) as Arc<dyn Protocol>,
//!     |_conn| {},
//! );
//! ```
//!
//! See [`features`] for what each Cargo feature controls.

pub mod config;
pub mod connection;
pub mod defer;
pub mod error;
pub mod fd_table;
pub mod lifecycle;
pub mod lock;
pub mod packet;
pub mod protocol;
pub mod pubsub;
pub mod uuid;

#[cfg(unix)]
pub mod sys;

#[cfg(feature = "os-poll")]
pub mod poll;
#[cfg(feature = "os-poll")]
pub mod reactor;
#[cfg(feature = "os-poll")]
pub mod runtime;

#[cfg(feature = "cluster")]
pub mod cluster;

pub use config::ReactorConfig;
pub use connection::{Connection, ForcedEvent};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{Protocol, RwHooks, ShutdownAction, SystemHooks};
pub use pubsub::{Engine, Message};
pub use uuid::Uuid;

#[cfg(feature = "os-poll")]
pub use poll::{Interest, Poller, ReadyEvent};
#[cfg(feature = "os-poll")]
pub use reactor::{install_signal_handlers, Reactor, WorkerPool};
#[cfg(feature = "os-poll")]
pub use runtime::Runtime;

/// Documents what each Cargo feature in this crate's manifest controls,
/// mirroring the doc-only `features` module `tokio-rs-mio` carries for the
/// same purpose.
///
/// ## `os-poll`
/// Enables the [`Poller`]/[`Runtime`]/[`Reactor`] machinery. Default-on.
/// Disabling it leaves only the plain data types ([`Uuid`], [`packet::Packet`],
/// [`pubsub::Message`]) usable - e.g. to unit-test protocol logic without
/// real sockets.
///
/// ## `cluster`
/// Enables [`cluster`], the parent/worker pipe-based pub/sub fan-out.
/// Implies `os-poll`.
pub mod features {}
