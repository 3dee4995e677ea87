//! Error types for the watch engine

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Result type alias for watch server operations
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while starting, driving or shutting down a watch
/// server.
///
/// Startup errors are returned synchronously from construction; registration
/// errors are returned from the submitting call; runtime errors arrive
/// asynchronously through [`EventSink::report_error`](crate::EventSink::report_error).
#[derive(Debug, Error)]
pub enum WatcherError {
	/// The platform event source could not be brought up; the server is
	/// unusable.
	#[error("Failed to start watcher: {reason}")]
	Startup { reason: String },

	/// Registration was attempted with a relative path.
	#[error("Path is not absolute: {0}")]
	NotAbsolute(PathBuf),

	/// Path does not exist
	#[error("Path does not exist: {0}")]
	PathNotFound(PathBuf),

	/// Path is not a directory
	#[error("Path is not a directory: {0}")]
	NotADirectory(PathBuf),

	/// The root is already covered by a live watch point.
	#[error("Already watching path: {0}")]
	AlreadyWatching(PathBuf),

	/// The OS refused to arm a watch for the path.
	#[error("Failed to watch path {path}: {reason}")]
	WatchFailed { path: PathBuf, reason: String },

	/// The OS refused to tear down a watch for the path.
	#[error("Failed to unwatch path {path}: {reason}")]
	UnwatchFailed { path: PathBuf, reason: String },

	/// A per-root runtime failure that is not expressible as a change event.
	#[error("Error while watching path {path}: {reason}")]
	Runtime { path: PathBuf, reason: String },

	/// The platform event stream could not be (re)opened; affected roots
	/// stop producing events until the next successful rebuild.
	#[error("Failed to open event stream: {reason}")]
	EventStream { reason: String },

	/// The watcher thread did not acknowledge a command in time. The command
	/// may still execute later; the watcher itself keeps running.
	#[error("Command did not complete within {0:?}")]
	CommandTimeout(Duration),

	/// The server has been closed; no further commands are accepted.
	#[error("Watch server is terminated")]
	Terminated,

	/// The watcher thread failed to exit within the shutdown budget.
	#[error("Watcher thread did not exit within {0:?}")]
	ShutdownTimeout(Duration),

	/// IO error
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}
