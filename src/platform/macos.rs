//! macOS backend: an FSEventStream scheduled on the watcher thread's CFRunLoop
//!
//! FSEvents takes an immutable root array at stream creation, so every
//! register and unregister closes the stream, mutates the root set and
//! reopens from the last seen event ID. Reopening from an old ID replays
//! historical records; freshly registered roots must not see that replay, so
//! each watch point carries a replay marker and events for fresh roots are
//! discarded until the stream signals that history is done. Commands are
//! drained between run-loop sessions, which is also when the stream is
//! closed, so watch-point mutation never races the stream callback.

use std::{
	collections::HashMap,
	ffi::{c_void, CStr, OsStr},
	os::{raw::c_char, unix::ffi::OsStrExt},
	panic::catch_unwind,
	path::{Path, PathBuf},
	sync::{mpsc, Arc},
	time::Duration,
};

use core_foundation::runloop::{kCFRunLoopBeforeWaiting, kCFRunLoopDefaultMode, CFRunLoop};
use fsevent_stream::{ffi::*, flags::StreamFlags, observer::create_oneshot_observer};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	error::{Result, WatcherError},
	event::ChangeType,
	server::{Handshake, ServerConfig, WatcherThread},
	sink::EventSink,
};

/// CFRef types are safe to move across threads per Apple's documentation.
struct SendWrapper<T>(T);

unsafe impl<T> Send for SendWrapper<T> {}

/// Wake-up state shared between caller threads and the watcher thread.
///
/// While a stream session is running the watcher publishes its run loop
/// here; a wake stops the loop. Outside a session the watcher parks on the
/// condvar and a wake unparks it. The `woken` flag closes the race between
/// publishing the run loop and actually entering it.
struct RunLoopShared {
	runloop: Mutex<Option<SendWrapper<CFRunLoop>>>,
	woken: Mutex<bool>,
	unpark: Condvar,
}

impl RunLoopShared {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			runloop: Mutex::new(None),
			woken: Mutex::new(false),
			unpark: Condvar::new(),
		})
	}

	fn wake(&self) {
		*self.woken.lock() = true;
		self.unpark.notify_all();

		let runloop = self.runloop.lock();
		if let Some(runloop) = runloop.as_ref() {
			// The stop must land while the loop is actually waiting,
			// otherwise it is lost before CFRunLoopRun enters.
			let (tx, rx) = mpsc::channel();
			let observer = create_oneshot_observer(kCFRunLoopBeforeWaiting, tx);
			runloop
				.0
				.add_observer(&observer, unsafe { kCFRunLoopDefaultMode });
			if !runloop.0.is_waiting() {
				let _ = rx.recv_timeout(Duration::from_secs(4));
			}
			runloop
				.0
				.remove_observer(&observer, unsafe { kCFRunLoopDefaultMode });
			runloop.0.stop();
		}
	}

	fn park(&self) {
		let mut woken = self.woken.lock();
		while !*woken {
			self.unpark.wait(&mut woken);
		}
		*woken = false;
	}

	fn take_woken(&self) -> bool {
		std::mem::replace(&mut *self.woken.lock(), false)
	}
}

pub(crate) struct PlatformServer {
	shared: Arc<RunLoopShared>,
}

impl PlatformServer {
	pub(crate) fn launch<S: EventSink>(
		sink: S,
		config: &ServerConfig,
		queue: Arc<CommandQueue>,
	) -> Result<(Self, WatcherThread)> {
		let shared = RunLoopShared::new();
		let handshake = Handshake::new();
		let latency = config.latency;

		let thread = {
			let shared = Arc::clone(&shared);
			let handshake = Arc::clone(&handshake);
			WatcherThread::spawn("fs-events watcher", move || {
				// Stream creation is deferred until roots exist, so there is
				// no fallible backend setup here.
				handshake.notify(Ok(()));

				let mut server = Box::new(MacServer {
					sink,
					queue,
					shared,
					watch_points: HashMap::new(),
					last_seen_event_id: kFSEventStreamEventIdSinceNow,
					finished_processing_historical_events: false,
					latency,
					terminated: false,
				});
				server.run();
			})?
		};

		if let Err(e) = handshake.wait() {
			let _ = thread.join(Duration::from_secs(1));
			return Err(e);
		}

		Ok((Self { shared }, thread))
	}

	pub(crate) fn wake(&self) -> Result<()> {
		self.shared.wake();
		Ok(())
	}
}

/// Whether a root may still see replayed historical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayMarker {
	/// Registered while a replay was pending; events are suppressed until
	/// the history-done marker arrives.
	New,
	/// Receives everything, including replayed history.
	Historical,
}

struct MacServer<S> {
	sink: S,
	queue: Arc<CommandQueue>,
	shared: Arc<RunLoopShared>,
	watch_points: HashMap<PathBuf, ReplayMarker>,
	last_seen_event_id: FSEventStreamEventId,
	finished_processing_historical_events: bool,
	latency: Duration,
	terminated: bool,
}

impl<S: EventSink> MacServer<S> {
	fn run(&mut self) {
		debug!("Watcher thread entering run loop");

		loop {
			self.process_commands();
			if self.terminated {
				break;
			}

			if self.watch_points.is_empty() {
				// Nothing to schedule; FSEvents rejects an empty root array.
				self.shared.park();
				continue;
			}

			let runloop = CFRunLoop::get_current();
			let stream = match self.open_event_stream(&runloop) {
				Ok(stream) => stream,
				Err(e) => {
					error!(%e, "Failed to open event stream");
					self.sink.report_error(&e);
					self.shared.park();
					continue;
				}
			};

			*self.shared.runloop.lock() = Some(SendWrapper(runloop));
			// A command may have been submitted while the stream was opening.
			if !self.shared.take_woken() {
				CFRunLoop::run_current();
			}
			*self.shared.runloop.lock() = None;

			self.close_event_stream(stream);
		}

		debug!("Watcher thread leaving run loop");
	}

	fn open_event_stream(&mut self, runloop: &CFRunLoop) -> Result<SysFSEventStream> {
		// There will be no history-done marker when starting from now.
		self.finished_processing_historical_events =
			self.last_seen_event_id == kFSEventStreamEventIdSinceNow;

		let context = StreamContext {
			server: self as *mut Self as *mut c_void,
		};
		let stream_context = SysFSEventStreamContext::new(context, release_stream_context);

		debug!(
			since = self.last_seen_event_id,
			roots = self.watch_points.len(),
			"Opening event stream"
		);
		let mut stream = SysFSEventStream::new(
			handle_stream_events::<S>,
			&stream_context,
			self.watch_points.keys(),
			self.last_seen_event_id,
			self.latency,
			kFSEventStreamCreateFlagNoDefer
				| kFSEventStreamCreateFlagFileEvents
				| kFSEventStreamCreateFlagWatchRoot,
		)
		.map_err(|e| WatcherError::EventStream {
			reason: format!("{e:?}"),
		})?;

		stream.schedule(runloop, unsafe { kCFRunLoopDefaultMode });
		stream.start();
		Ok(stream)
	}

	fn close_event_stream(&mut self, mut stream: SysFSEventStream) {
		stream.stop();
		stream.invalidate();
		debug!(last_seen = self.last_seen_event_id, "Closed event stream");
	}

	fn process_commands(&mut self) {
		while let Some(pending) = self.queue.pop() {
			let result = match &pending.command {
				Command::RegisterPaths(paths) => self.register(paths),
				Command::UnregisterPaths(paths) => self.unregister(paths),
				Command::Terminate => {
					debug!("Terminate received");
					self.terminated = true;
					self.queue.close();
					Ok(CommandOutcome::Done)
				}
			};
			pending.submission.complete(result);

			if self.terminated {
				break;
			}
		}
	}

	fn register(&mut self, paths: &[PathBuf]) -> Result<CommandOutcome> {
		for path in paths {
			if self.watch_points.contains_key(path) {
				return Err(WatcherError::AlreadyWatching(path.clone()));
			}
			if !path.exists() {
				return Err(WatcherError::PathNotFound(path.clone()));
			}
			if !path.is_dir() {
				return Err(WatcherError::NotADirectory(path.clone()));
			}

			let marker = if self.last_seen_event_id == kFSEventStreamEventIdSinceNow {
				// No replay pending; the root sees live events immediately.
				ReplayMarker::Historical
			} else {
				ReplayMarker::New
			};
			debug!(root = %path.display(), ?marker, "Registering watch point");
			self.watch_points.insert(path.clone(), marker);
		}
		Ok(CommandOutcome::Done)
	}

	fn unregister(&mut self, paths: &[PathBuf]) -> Result<CommandOutcome> {
		let mut all_watched = true;
		for path in paths {
			if self.watch_points.remove(path).is_none() {
				debug!(path = %path.display(), "Path is not watched");
				all_watched = false;
			} else {
				debug!(root = %path.display(), "Stopped watching root");
			}
		}
		Ok(CommandOutcome::Unwatched(all_watched))
	}

	fn handle_events(
		&mut self,
		num_events: usize,
		event_paths: *mut c_void,
		event_flags: *const FSEventStreamEventFlags,
		event_ids: *const FSEventStreamEventId,
	) {
		let paths = event_paths as *const *const c_char;
		for i in 0..num_events {
			let (raw_flags, id) = unsafe { (*event_flags.add(i), *event_ids.add(i)) };
			let bytes = unsafe { CStr::from_ptr(*paths.add(i)) };
			let path = Path::new(OsStr::from_bytes(bytes.to_bytes()));
			self.handle_event(id, raw_flags, path);
		}
	}

	fn handle_event(
		&mut self,
		id: FSEventStreamEventId,
		raw_flags: FSEventStreamEventFlags,
		path: &Path,
	) {
		self.last_seen_event_id = id;
		let flags = StreamFlags::from_bits_truncate(raw_flags);
		trace!(id, %flags, path = %path.display(), "Received stream event");

		if flags.contains(StreamFlags::HISTORY_DONE) {
			// From here on freshly registered roots see live events.
			for marker in self.watch_points.values_mut() {
				if *marker == ReplayMarker::New {
					*marker = ReplayMarker::Historical;
				}
			}
			self.finished_processing_historical_events = true;
			debug!(id, "Finished processing historical events");
			return;
		}

		if id == 0 && flags.contains(StreamFlags::ROOT_CHANGED) {
			self.sink.path_changed(ChangeType::Invalidated, path);
			return;
		}

		if !self.finished_processing_historical_events {
			match self.replay_marker(path) {
				Some(ReplayMarker::New) => {
					trace!(id, "Ignoring historical event for freshly registered root");
					return;
				}
				Some(ReplayMarker::Historical) => {}
				None => {
					warn!(path = %path.display(), "No watch point covers event path");
				}
			}
		}

		if ignored_flags().contains(flags) {
			trace!(id, "Ignoring event");
			return;
		}

		match translate_flags(flags) {
			Some(change) => self.sink.path_changed(change, path),
			None => {
				warn!(id, %flags, path = %path.display(), "Unrecognized event flags");
				self.sink.path_changed(ChangeType::Unknown, path);
			}
		}
	}

	/// Watch point covering `path`, if any.
	fn replay_marker(&self, path: &Path) -> Option<ReplayMarker> {
		self.watch_points
			.iter()
			.find(|(root, _)| path.starts_with(root))
			.map(|(_, marker)| *marker)
	}
}

/// Flag bits that never produce an event on their own. Anything outside this
/// set has to be handled; new macOS flags surface as `Unknown` events.
fn ignored_flags() -> StreamFlags {
	StreamFlags::USER_DROPPED
		| StreamFlags::KERNEL_DROPPED
		| StreamFlags::HISTORY_DONE
		| StreamFlags::OWN_EVENT
		| StreamFlags::IS_FILE
		| StreamFlags::IS_DIR
		| StreamFlags::IS_SYMLINK
		| StreamFlags::IS_HARDLINK
		| StreamFlags::IS_LAST_HARDLINK
		| StreamFlags::ITEM_CLONED
}

fn translate_flags(flags: StreamFlags) -> Option<ChangeType> {
	if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
		Some(ChangeType::Overflow)
	} else if flags.intersects(StreamFlags::MOUNT | StreamFlags::UNMOUNT) {
		Some(ChangeType::Invalidated)
	} else if flags.contains(StreamFlags::ITEM_RENAMED) {
		// FSEvents pairs renames asymmetrically: the record that also
		// carries ItemCreated describes the vacated source path.
		if flags.contains(StreamFlags::ITEM_CREATED) {
			Some(ChangeType::Removed)
		} else {
			Some(ChangeType::Created)
		}
	} else if flags.contains(StreamFlags::ITEM_MODIFIED) {
		Some(ChangeType::Modified)
	} else if flags.contains(StreamFlags::ITEM_REMOVED) {
		Some(ChangeType::Removed)
	} else if flags.intersects(
		StreamFlags::INODE_META_MOD
			| StreamFlags::FINDER_INFO_MOD
			| StreamFlags::ITEM_CHANGE_OWNER
			| StreamFlags::ITEM_XATTR_MOD,
	) {
		Some(ChangeType::Modified)
	} else if flags.contains(StreamFlags::ITEM_CREATED) {
		Some(ChangeType::Created)
	} else {
		None
	}
}

/// Carries the server pointer through the FSEvents C callback.
#[derive(Clone)]
struct StreamContext {
	server: *mut c_void,
}

extern "C" fn release_stream_context(context: *mut c_void) {
	// The stream context boxes a StreamContext; reclaim it here.
	drop(unsafe { Box::from_raw(context as *mut StreamContext) });
}

extern "C" fn handle_stream_events<S: EventSink>(
	_stream_ref: SysFSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const FSEventStreamEventFlags,
	event_ids: *const FSEventStreamEventId,
) {
	drop(catch_unwind(move || {
		let context = unsafe { &*(info as *const StreamContext) };
		let server = unsafe { &mut *(context.server as *mut MacServer<S>) };
		server.handle_events(num_events, event_paths, event_flags, event_ids);
	}));
}
