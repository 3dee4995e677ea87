//! Native filesystem change notification engine
//!
//! `fs-events` watches a set of directory roots and asynchronously delivers
//! a stream of typed change events (created / removed / modified /
//! invalidated / unknown / overflow) for files and subdirectories beneath
//! them, using the native OS primitives directly: inotify on Linux,
//! FSEvents on macOS and `ReadDirectoryChangesW` with overlapped I/O on
//! Windows.
//!
//! # Architecture
//!
//! Each [`WatchServer`] owns one dedicated watcher thread that pumps the
//! platform event loop, owns every OS watch handle, and is the only thread
//! that mutates watch-point state or invokes the [`EventSink`]. Caller
//! threads interact through a mutex-protected command queue
//! (register / unregister / terminate), with each command awaitable by its
//! submitter and carrying a failure slot.
//!
//! # Delivery contract
//!
//! - Events from a single root arrive in the order the OS produced them;
//!   there is no ordering across roots.
//! - A registration that returns successfully is observed before any event
//!   it enables; events produced after an unregister returns are not
//!   delivered.
//! - Overflow (lost OS records) is reported as a single `Overflow` or
//!   `Invalidated` event per affected root, never hidden.
//! - After [`WatchServer::close`] returns, no sink callback fires.
//!
//! Exactly-once delivery, rename pairing, debouncing and path filtering are
//! explicitly left to higher layers.

mod command;
mod error;
mod event;
pub mod path;
mod platform;
mod server;
mod sink;

pub use error::{Result, WatcherError};
pub use event::{ChangeEvent, ChangeType, FAILURE_ORDINAL};
pub use server::{ServerConfig, WatchServer};
pub use sink::EventSink;
