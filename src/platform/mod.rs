//! Platform backends
//!
//! One watch server implementation per OS, each pumping the native event
//! source on the dedicated watcher thread and translating raw records into
//! the normalized [`ChangeType`](crate::ChangeType) model:
//!
//! - Linux: one inotify fd for all roots, multiplexed with an eventfd
//!   wake-up via `poll(2)`.
//! - macOS: an FSEventStream scheduled on a CFRunLoop; the stream is
//!   rebuilt on every root-set change because FSEvents takes an immutable
//!   root array.
//! - Windows: per-root overlapped `ReadDirectoryChangesW` with completion
//!   routines, driven by an alertable wait; commands arrive as user APCs.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
pub(crate) use linux::PlatformServer;
#[cfg(target_os = "macos")]
pub(crate) use macos::PlatformServer;
#[cfg(target_os = "windows")]
pub(crate) use windows::PlatformServer;

/// Lifecycle of one registered root.
///
/// `NotListening → Listening` when the native watch is armed,
/// `Listening → NotListening` transiently while a batch is drained and the
/// watch re-armed, `Listening → Cancelled` once unregister or shutdown has
/// requested cancellation (the native layer still owes a terminal event),
/// `Cancelled → Finished` on terminal completion, and
/// `NotListening → Finished` when arming fails.
#[cfg(any(target_os = "linux", target_os = "windows"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchPointStatus {
	NotListening,
	Listening,
	Cancelled,
	Finished,
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl Default for WatchPointStatus {
	/// A watch point starts out constructed but not yet armed.
	fn default() -> Self {
		Self::NotListening
	}
}
