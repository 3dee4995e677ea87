//! Contract between the watch servers and their host
//!
//! The sink is the only outbound seam of the engine: every normalized event
//! and every asynchronous failure crosses it. A server owns its sink by value
//! for its whole lifetime and invokes it exclusively from the watcher thread
//! (native callbacks and APCs also run there), so implementations never need
//! internal locking for ordering.

use std::{path::Path, sync::mpsc};

use tracing::warn;

use crate::{event::ChangeEvent, ChangeType, WatcherError};

/// Receives normalized change events and asynchronous failures from a watch
/// server.
pub trait EventSink: Send + 'static {
	/// Invoked once per normalized event. `path` is absolute, never empty,
	/// and already in host form (no extended-length prefix).
	fn path_changed(&self, change: ChangeType, path: &Path);

	/// Invoked with failures that cannot be attributed to a submitted
	/// command: per-root runtime errors, undecodable events, shutdown
	/// stragglers.
	fn report_error(&self, error: &WatcherError);
}

/// Ships events into a channel, which is how most hosts consume the stream.
/// Failures are logged, as a plain channel has no failure lane.
impl EventSink for mpsc::Sender<ChangeEvent> {
	fn path_changed(&self, change: ChangeType, path: &Path) {
		if self
			.send(ChangeEvent {
				change,
				path: path.to_path_buf(),
			})
			.is_err()
		{
			warn!(path = %path.display(), "Change event receiver dropped, event lost");
		}
	}

	fn report_error(&self, error: &WatcherError) {
		warn!(%error, "Watcher reported an error");
	}
}
