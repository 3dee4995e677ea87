//! Platform-independent server skeleton
//!
//! Owns the dedicated watcher thread and the command queue, and exposes the
//! public [`WatchServer`] facade. All watch-point state lives on the watcher
//! thread; caller threads only ever touch the command queue and the
//! platform-specific wake-up primitive, which keeps the OS-facing structures
//! single-owner and lock-free.

use std::{
	path::PathBuf,
	sync::Arc,
	thread::{self, JoinHandle},
	time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	error::{Result, WatcherError},
	path,
	platform::PlatformServer,
	sink::EventSink,
};

/// Budget for the watcher thread to exit after `Terminate` was submitted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-watch-point event buffer on Windows.
const DEFAULT_EVENT_BUFFER_SIZE: usize = 16 * 1024;

const MIN_EVENT_BUFFER_SIZE: usize = 4 * 1024;

/// Upper bound for overflow-prone workloads.
const MAX_EVENT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Construction-time configuration. There is no other configuration surface:
/// no files, no environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// FSEvents batching latency (macOS only).
	pub latency: Duration,
	/// Bound on how long a caller blocks for command completion. One global
	/// value for all platforms.
	pub command_timeout: Duration,
	/// Per-watch-point event buffer size (Windows only). Clamped to
	/// [4 KiB, 16 MiB]; raise it for overflow-prone workloads.
	pub event_buffer_size: usize,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			latency: Duration::from_millis(100),
			command_timeout: Duration::from_secs(5),
			event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
		}
	}
}

impl ServerConfig {
	fn clamped(mut self) -> Self {
		self.event_buffer_size = self
			.event_buffer_size
			.clamp(MIN_EVENT_BUFFER_SIZE, MAX_EVENT_BUFFER_SIZE);
		self
	}
}

/// Startup handshake between the launching thread and the watcher thread.
///
/// The watcher thread performs its backend initialization, then signals
/// either success or the captured startup failure; the launcher blocks on
/// the signal and re-raises the failure.
pub(crate) struct Handshake {
	result: Mutex<Option<Result<()>>>,
	ready: Condvar,
}

impl Handshake {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			result: Mutex::new(None),
			ready: Condvar::new(),
		})
	}

	/// Called once from the watcher thread after backend initialization.
	pub(crate) fn notify(&self, result: Result<()>) {
		let mut slot = self.result.lock();
		*slot = Some(result);
		self.ready.notify_all();
	}

	pub(crate) fn wait(&self) -> Result<()> {
		let mut slot = self.result.lock();
		while slot.is_none() {
			if self
				.ready
				.wait_for(&mut slot, SHUTDOWN_TIMEOUT)
				.timed_out()
			{
				return Err(WatcherError::Startup {
					reason: "watcher thread did not report startup".into(),
				});
			}
		}
		slot.take().expect("handshake signalled without a result")
	}
}

struct ExitLatch {
	exited: Mutex<bool>,
	cond: Condvar,
}

impl ExitLatch {
	fn wait(&self, timeout: Duration) -> bool {
		let mut exited = self.exited.lock();
		while !*exited {
			if self.cond.wait_for(&mut exited, timeout).timed_out() {
				return *exited;
			}
		}
		true
	}
}

/// The dedicated watcher thread, joinable within a bounded budget.
pub(crate) struct WatcherThread {
	handle: Option<JoinHandle<()>>,
	exit: Arc<ExitLatch>,
}

impl WatcherThread {
	pub(crate) fn spawn(
		name: &str,
		body: impl FnOnce() + Send + 'static,
	) -> Result<Self> {
		let exit = Arc::new(ExitLatch {
			exited: Mutex::new(false),
			cond: Condvar::new(),
		});

		let latch = Arc::clone(&exit);
		let handle = thread::Builder::new()
			.name(name.to_owned())
			.spawn(move || {
				body();
				*latch.exited.lock() = true;
				latch.cond.notify_all();
			})
			.map_err(|e| WatcherError::Startup {
				reason: format!("failed to spawn watcher thread: {e}"),
			})?;

		Ok(Self {
			handle: Some(handle),
			exit,
		})
	}

	/// Joins the thread, giving up after `budget`. A thread that refuses to
	/// exit is detached rather than blocking the host forever.
	pub(crate) fn join(mut self, budget: Duration) -> Result<()> {
		if self.exit.wait(budget) {
			if let Some(handle) = self.handle.take() {
				let _ = handle.join();
			}
			Ok(())
		} else {
			self.handle.take();
			Err(WatcherError::ShutdownTimeout(budget))
		}
	}
}

/// A running watch session: one watcher thread plus the OS watch handles it
/// owns.
///
/// Construction launches the watcher thread and blocks until the platform
/// event source is up; a startup failure is returned synchronously and the
/// server is unusable. All later failures arrive through the
/// [`EventSink`].
///
/// ```no_run
/// use std::sync::mpsc;
/// use fs_events::{ServerConfig, WatchServer};
///
/// let (tx, rx) = mpsc::channel();
/// let mut server = WatchServer::new(tx, ServerConfig::default())?;
/// server.start_watching(vec!["/some/dir".into()])?;
/// while let Ok(event) = rx.recv() {
///     println!("{:?} {}", event.change, event.path.display());
/// }
/// server.close()?;
/// # Ok::<(), fs_events::WatcherError>(())
/// ```
pub struct WatchServer {
	platform: PlatformServer,
	queue: Arc<CommandQueue>,
	thread: Option<WatcherThread>,
	command_timeout: Duration,
}

impl WatchServer {
	/// Launches the watcher thread and arms the platform event source. The
	/// sink is owned by the server until the watcher thread exits.
	pub fn new<S: EventSink>(sink: S, config: ServerConfig) -> Result<Self> {
		let config = config.clamped();
		let queue = CommandQueue::new();
		let (platform, thread) = PlatformServer::launch(sink, &config, Arc::clone(&queue))?;

		debug!("Watch server started");

		Ok(Self {
			platform,
			queue,
			thread: Some(thread),
			command_timeout: config.command_timeout,
		})
	}

	/// Registers the given roots. An empty list is a no-op success. Fails if
	/// any path is relative, missing, not a directory or already watched;
	/// roots registered earlier in the same call stay registered.
	///
	/// A registration that returns successfully is observed by the watcher
	/// before any event it enables.
	pub fn start_watching(&self, paths: Vec<PathBuf>) -> Result<()> {
		if paths.is_empty() {
			return Ok(());
		}
		for path in &paths {
			path::ensure_absolute(path)?;
		}
		self.submit(Command::RegisterPaths(paths)).map(|_| ())
	}

	/// Unregisters the given roots, returning `true` iff every provided path
	/// was actually watched. Events produced before this returns may still
	/// be delivered afterwards (OS delivery lag); events produced after it
	/// returns are not.
	pub fn stop_watching(&self, paths: Vec<PathBuf>) -> Result<bool> {
		if paths.is_empty() {
			return Ok(true);
		}
		match self.submit(Command::UnregisterPaths(paths))? {
			CommandOutcome::Unwatched(all_watched) => Ok(all_watched),
			CommandOutcome::Done => Ok(true),
		}
	}

	/// Terminates the session and joins the watcher thread within a 5 s
	/// budget. Idempotent. After this returns no sink callback fires. A
	/// thread that fails to exit is reported as
	/// [`WatcherError::ShutdownTimeout`] and detached.
	pub fn close(&mut self) -> Result<()> {
		let Some(thread) = self.thread.take() else {
			return Ok(());
		};

		let submission = self.queue.submit(Command::Terminate);
		if let Err(e) = self.platform.wake() {
			warn!(%e, "Failed to wake watcher thread for termination");
		}
		if let Err(e) = submission.wait(self.command_timeout) {
			warn!(%e, "Terminate command did not complete cleanly");
		}

		thread.join(SHUTDOWN_TIMEOUT).map_err(|e| {
			error!(%e, "Watcher thread outlived the shutdown budget");
			e
		})
	}

	fn submit(&self, command: Command) -> Result<CommandOutcome> {
		if self.thread.is_none() {
			return Err(WatcherError::Terminated);
		}
		let submission = self.queue.submit(command);
		self.platform.wake()?;
		submission.wait(self.command_timeout)
	}
}

impl Drop for WatchServer {
	fn drop(&mut self) {
		if self.thread.is_some() {
			if let Err(e) = self.close() {
				error!(%e, "Failed to close watch server on drop");
			}
		}
	}
}
