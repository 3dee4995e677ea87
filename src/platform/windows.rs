//! Windows backend: overlapped `ReadDirectoryChangesW` driven by alertable waits
//!
//! The watcher thread spends its life in `SleepEx(INFINITE, TRUE)`. Commands
//! arrive as user APCs queued onto the thread; directory read completions
//! arrive as I/O APCs. Both kinds run serially on the watcher thread, so
//! watch-point state needs no locking. Each watch point owns its directory
//! handle, a pre-allocated event buffer and the overlapped control block
//! whose `hEvent` smuggles the watch-point pointer into the completion
//! routine. Roots longer than the classic Win32 limits are rewritten to the
//! extended-length form before reaching the OS and reported back without it.

use std::{
	collections::HashMap,
	ffi::{c_void, OsStr, OsString},
	io, mem,
	os::windows::ffi::{OsStrExt, OsStringExt},
	path::{Path, PathBuf},
	slice,
	sync::{mpsc, Arc},
	time::Duration,
};

use tracing::{debug, error, trace, warn};
use windows::{
	core::PCWSTR,
	Win32::{
		Foundation::{
			CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED,
			ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE,
		},
		Storage::FileSystem::{
			CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION,
			FILE_ACTION_ADDED, FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED,
			FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
			FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS, FILE_NOTIFY_CHANGE,
			FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
			FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
			FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS,
			FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
			FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
			INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
		},
		System::{
			IO::{CancelIoEx, OVERLAPPED},
			Threading::{
				GetCurrentProcess, GetCurrentThread, QueueUserAPC, SetThreadPriority, SleepEx,
				INFINITE, THREAD_PRIORITY_ABOVE_NORMAL,
			},
		},
	},
};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	error::{Result, WatcherError},
	event::ChangeType,
	path as path_codec,
	platform::WatchPointStatus,
	server::{Handshake, ServerConfig, WatcherThread},
	sink::EventSink,
};

/// Duplicated handle of the watcher thread, target of `QueueUserAPC`.
struct ThreadHandle(HANDLE);

unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl Drop for ThreadHandle {
	fn drop(&mut self) {
		unsafe {
			let _ = CloseHandle(self.0);
		}
	}
}

struct SendPtr(*mut WinServer);

unsafe impl Send for SendPtr {}

pub(crate) struct PlatformServer {
	thread_handle: Arc<ThreadHandle>,
	server: *mut WinServer,
}

// The server pointer is only ever dereferenced by APCs running on the
// watcher thread, which stays alive until the terminate command has been
// executed; after that no APC is queued anymore.
unsafe impl Send for PlatformServer {}
unsafe impl Sync for PlatformServer {}

impl PlatformServer {
	pub(crate) fn launch<S: EventSink>(
		sink: S,
		config: &ServerConfig,
		queue: Arc<CommandQueue>,
	) -> Result<(Self, WatcherThread)> {
		let handshake = Handshake::new();
		let (ready_tx, ready_rx) = mpsc::channel();
		let buffer_size = config.event_buffer_size;

		let thread = {
			let handshake = Arc::clone(&handshake);
			WatcherThread::spawn("fs-events watcher", move || {
				let thread_handle = match duplicate_current_thread_handle() {
					Ok(handle) => handle,
					Err(e) => {
						handshake.notify(Err(e));
						return;
					}
				};

				// Completion routines have to keep up with bursts of changes.
				if let Err(e) = unsafe {
					SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL)
				} {
					warn!(%e, "Failed to raise watcher thread priority");
				}

				let mut server = Box::new(WinServer {
					sink: Box::new(sink),
					queue,
					watch_points: HashMap::new(),
					buffer_size,
					terminated: false,
				});

				if ready_tx
					.send((thread_handle, SendPtr(&mut *server as *mut WinServer)))
					.is_err()
				{
					handshake.notify(Err(WatcherError::Startup {
						reason: "launcher went away during startup".into(),
					}));
					return;
				}
				handshake.notify(Ok(()));

				server.run();
			})?
		};

		if let Err(e) = handshake.wait() {
			let _ = thread.join(Duration::from_secs(1));
			return Err(e);
		}
		let (thread_handle, server) = ready_rx.recv().map_err(|_| WatcherError::Startup {
			reason: "watcher thread went away during startup".into(),
		})?;

		Ok((
			Self {
				thread_handle: Arc::new(thread_handle),
				server: server.0,
			},
			thread,
		))
	}

	pub(crate) fn wake(&self) -> Result<()> {
		let queued = unsafe {
			QueueUserAPC(
				Some(process_commands_apc),
				self.thread_handle.0,
				self.server as usize,
			)
		};
		if queued == 0 {
			return Err(WatcherError::Io(io::Error::last_os_error()));
		}
		Ok(())
	}
}

fn duplicate_current_thread_handle() -> Result<ThreadHandle> {
	let mut handle = HANDLE::default();
	unsafe {
		DuplicateHandle(
			GetCurrentProcess(),
			GetCurrentThread(),
			GetCurrentProcess(),
			&mut handle,
			0,
			false.into(),
			DUPLICATE_SAME_ACCESS,
		)
	}
	.map_err(|e| WatcherError::Startup {
		reason: format!("failed to duplicate watcher thread handle: {e}"),
	})?;
	Ok(ThreadHandle(handle))
}

fn to_wide(s: &OsStr) -> Vec<u16> {
	s.encode_wide().chain(Some(0)).collect()
}

/// The extended-length form handed to the OS (unique key of the watch point)
/// and the host-facing form used in reported events.
fn canonical_forms(path: &Path) -> (PathBuf, PathBuf) {
	match path.to_str() {
		Some(s) => (
			PathBuf::from(path_codec::to_extended_length(s)),
			PathBuf::from(path_codec::strip_extended_length(s)),
		),
		None => (path.to_path_buf(), path.to_path_buf()),
	}
}

fn notify_filter() -> FILE_NOTIFY_CHANGE {
	FILE_NOTIFY_CHANGE_FILE_NAME
		| FILE_NOTIFY_CHANGE_DIR_NAME
		| FILE_NOTIFY_CHANGE_ATTRIBUTES
		| FILE_NOTIFY_CHANGE_SIZE
		| FILE_NOTIFY_CHANGE_LAST_WRITE
		| FILE_NOTIFY_CHANGE_LAST_ACCESS
		| FILE_NOTIFY_CHANGE_CREATION
		| FILE_NOTIFY_CHANGE_SECURITY
}

enum ListenResult {
	Success,
	/// Arming failed because the directory no longer exists.
	Deleted,
	Failed(WatcherError),
}

struct WatchPoint {
	/// Extended-length form handed to the OS; unique key of the point.
	canonical: PathBuf,
	/// Host-facing form used for reported events.
	root: PathBuf,
	handle: HANDLE,
	status: WatchPointStatus,
	buffer: Vec<u8>,
	overlapped: OVERLAPPED,
	/// Non-owning back-reference; the server strictly outlives its points.
	server: *mut WinServer,
}

impl WatchPoint {
	fn new(
		server: *mut WinServer,
		root: PathBuf,
		canonical: PathBuf,
		buffer_size: usize,
	) -> Result<Box<Self>> {
		let wide = to_wide(canonical.as_os_str());
		let handle = unsafe {
			CreateFileW(
				PCWSTR::from_raw(wide.as_ptr()),
				FILE_LIST_DIRECTORY.0,
				FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
				None,
				OPEN_EXISTING,
				FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
				None,
			)
		}
		.map_err(|e| WatcherError::WatchFailed {
			path: root.clone(),
			reason: e.to_string(),
		})?;

		let mut point = Box::new(Self {
			canonical,
			root,
			handle,
			status: WatchPointStatus::default(),
			buffer: vec![0u8; buffer_size],
			overlapped: unsafe { mem::zeroed() },
			server,
		});
		// The completion routine recovers the watch point through hEvent,
		// which overlapped reads leave untouched.
		point.overlapped.hEvent = HANDLE(&mut *point as *mut Self as *mut c_void);

		match point.listen() {
			ListenResult::Success => Ok(point),
			ListenResult::Deleted => {
				unsafe {
					let _ = CloseHandle(point.handle);
				}
				Err(WatcherError::NotADirectory(point.root.clone()))
			}
			ListenResult::Failed(e) => {
				unsafe {
					let _ = CloseHandle(point.handle);
				}
				Err(e)
			}
		}
	}

	/// Arms the next asynchronous directory read.
	fn listen(&mut self) -> ListenResult {
		let result = unsafe {
			ReadDirectoryChangesW(
				self.handle,
				self.buffer.as_mut_ptr() as *mut c_void,
				self.buffer.len() as u32,
				true.into(),
				notify_filter(),
				None,
				Some(&mut self.overlapped as *mut OVERLAPPED),
				Some(handle_event_complete),
			)
		};

		match result {
			Ok(()) => {
				self.status = WatchPointStatus::Listening;
				ListenResult::Success
			}
			Err(e) => {
				self.status = WatchPointStatus::Finished;
				if e.code() == ERROR_ACCESS_DENIED.to_hresult() && !self.is_valid_directory() {
					ListenResult::Deleted
				} else {
					ListenResult::Failed(WatcherError::WatchFailed {
						path: self.root.clone(),
						reason: e.to_string(),
					})
				}
			}
		}
	}

	/// Requests cancellation of the outstanding read. Returns `true` when a
	/// terminal `ERROR_OPERATION_ABORTED` completion is still owed.
	fn cancel(&mut self) -> Result<bool> {
		if self.status != WatchPointStatus::Listening {
			return Ok(false);
		}

		debug!(root = %self.root.display(), "Cancelling watch point");
		self.status = WatchPointStatus::Cancelled;

		match unsafe { CancelIoEx(self.handle, Some(&self.overlapped as *const OVERLAPPED)) } {
			Ok(()) => Ok(true),
			Err(e) => {
				self.status = WatchPointStatus::Finished;
				if e.code() == ERROR_NOT_FOUND.to_hresult() {
					// The read already completed; a typical race.
					trace!(root = %self.root.display(), "Watch point already finished");
					Ok(false)
				} else {
					Err(WatcherError::UnwatchFailed {
						path: self.root.clone(),
						reason: e.to_string(),
					})
				}
			}
		}
	}

	fn is_valid_directory(&self) -> bool {
		let wide = to_wide(self.canonical.as_os_str());
		let attributes = unsafe { GetFileAttributesW(PCWSTR::from_raw(wide.as_ptr())) };
		attributes != INVALID_FILE_ATTRIBUTES && attributes & FILE_ATTRIBUTE_DIRECTORY.0 != 0
	}

	/// Runs as I/O APC on the watcher thread.
	fn handle_completion(&mut self, error_code: u32, bytes_transferred: u32) {
		if error_code == ERROR_OPERATION_ABORTED.0 {
			debug!(root = %self.root.display(), status = ?self.status, "Finished watching");
			unsafe {
				let _ = CloseHandle(self.handle);
			}
			self.status = WatchPointStatus::Finished;
			return;
		}

		if self.status != WatchPointStatus::Listening {
			trace!(
				root = %self.root.display(),
				status = ?self.status,
				bytes_transferred,
				"Ignoring completion for inactive watch point"
			);
			return;
		}
		self.status = WatchPointStatus::NotListening;

		let server = unsafe { &mut *self.server };
		server.handle_events(self, error_code, bytes_transferred);
	}
}

struct WinServer {
	sink: Box<dyn EventSink>,
	queue: Arc<CommandQueue>,
	watch_points: HashMap<PathBuf, Box<WatchPoint>>,
	buffer_size: usize,
	terminated: bool,
}

impl WinServer {
	fn run(&mut self) {
		debug!("Watcher thread entering alertable wait loop");

		while !self.terminated {
			unsafe {
				SleepEx(INFINITE, true.into());
			}
		}

		// Terminated: cancel whatever is still listening and give the abort
		// completions one APC cycle to drain.
		debug!("Run loop finished, cancelling remaining watch points");
		let mut pending = 0usize;
		for point in self.watch_points.values_mut() {
			match point.status {
				WatchPointStatus::Listening => match point.cancel() {
					Ok(true) => pending += 1,
					Ok(false) => {}
					Err(e) => error!(%e, "Failed to cancel watch point"),
				},
				WatchPointStatus::Cancelled => pending += 1,
				_ => {}
			}
		}
		if pending > 0 {
			debug!(pending, "Waiting for pending watch points to finish");
			unsafe {
				SleepEx(0, true.into());
			}
		}

		for point in self.watch_points.values() {
			match point.status {
				WatchPointStatus::NotListening | WatchPointStatus::Finished => {}
				status => warn!(
					root = %point.root.display(),
					?status,
					"Watch point did not finish before termination"
				),
			}
		}
		self.watch_points.clear();
	}

	/// Runs as user APC on the watcher thread.
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
			let (canonical, root) = canonical_forms(path);

			if let Some(existing) = self.watch_points.get(&canonical) {
				if existing.status != WatchPointStatus::Finished {
					return Err(WatcherError::AlreadyWatching(path.clone()));
				}
				// A finished point (overflowed, or its root vanished) may be
				// replaced by a fresh registration.
				self.watch_points.remove(&canonical);
			}
			// Check through the extended-length form so roots past the
			// classic path limit resolve.
			if !canonical.exists() {
				return Err(WatcherError::PathNotFound(path.clone()));
			}
			if !canonical.is_dir() {
				return Err(WatcherError::NotADirectory(path.clone()));
			}

			let server = self as *mut Self;
			let point = WatchPoint::new(server, root, canonical.clone(), self.buffer_size)?;
			self.watch_points.insert(canonical, point);
			debug!(root = %path.display(), "Now watching root");
		}
		Ok(CommandOutcome::Done)
	}

	fn unregister(&mut self, paths: &[PathBuf]) -> Result<CommandOutcome> {
		let mut all_watched = true;
		for path in paths {
			let (canonical, _) = canonical_forms(path);
			let Some(mut point) = self.watch_points.remove(&canonical) else {
				debug!(path = %path.display(), "Path is not watched");
				all_watched = false;
				continue;
			};

			match point.cancel() {
				Ok(true) => {
					// The point must stay alive until the abort completion
					// has run against its overlapped block.
					unsafe {
						SleepEx(0, true.into());
					}
				}
				Ok(false) => {}
				Err(e) => error!(%e, "Failed to cancel watch point"),
			}
			debug!(root = %point.root.display(), "Stopped watching root");
		}
		Ok(CommandOutcome::Unwatched(all_watched))
	}

	fn handle_events(&mut self, point: &mut WatchPoint, error_code: u32, bytes_transferred: u32) {
		if error_code != ERROR_SUCCESS.0 {
			if error_code == ERROR_ACCESS_DENIED.0 && !point.is_valid_directory() {
				// The root itself is gone.
				self.sink.path_changed(ChangeType::Removed, &point.root);
				point.status = WatchPointStatus::Finished;
			} else {
				point.status = WatchPointStatus::Finished;
				self.sink.report_error(&WatcherError::Runtime {
					path: point.root.clone(),
					reason: format!("completion routine received error code {error_code}"),
				});
			}
			return;
		}

		if self.terminated {
			trace!(
				root = %point.root.display(),
				bytes_transferred,
				"Ignoring incoming events because server is terminating"
			);
			return;
		}

		if bytes_transferred == 0 {
			// Buffer overflow: the changes are lost and the client has to
			// rescan and re-register to resume.
			warn!(root = %point.root.display(), "Detected overflow");
			self.sink.path_changed(ChangeType::Invalidated, &point.root);
			point.status = WatchPointStatus::Finished;
			return;
		}

		let mut index = 0usize;
		loop {
			let info = unsafe {
				&*(point.buffer.as_ptr().add(index) as *const FILE_NOTIFY_INFORMATION)
			};
			self.handle_event(&point.root, info);
			if info.NextEntryOffset == 0 {
				break;
			}
			index += info.NextEntryOffset as usize;
		}

		match point.listen() {
			ListenResult::Success => {}
			ListenResult::Deleted => self.sink.path_changed(ChangeType::Removed, &point.root),
			ListenResult::Failed(e) => {
				error!(%e, "Failed to rearm watch point");
				self.sink.report_error(&e);
			}
		}
	}

	fn handle_event(&mut self, root: &Path, info: &FILE_NOTIFY_INFORMATION) {
		let name_len = info.FileNameLength as usize / mem::size_of::<u16>();
		let name = unsafe { slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
		let path = root.join(OsString::from_wide(name));

		let change = translate_action(info.Action);
		if change == ChangeType::Unknown {
			warn!(action = info.Action.0, path = %path.display(), "Unknown file action");
		}
		self.sink.path_changed(change, &path);
	}
}

fn translate_action(action: FILE_ACTION) -> ChangeType {
	match action {
		FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeType::Created,
		FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeType::Removed,
		FILE_ACTION_MODIFIED => ChangeType::Modified,
		_ => ChangeType::Unknown,
	}
}

unsafe extern "system" fn process_commands_apc(param: usize) {
	let server = &mut *(param as *mut WinServer);
	server.process_commands();
}

unsafe extern "system" fn handle_event_complete(
	error_code: u32,
	bytes_transferred: u32,
	overlapped: *mut OVERLAPPED,
) {
	let point = &mut *((*overlapped).hEvent.0 as *mut WatchPoint);
	point.handle_completion(error_code, bytes_transferred);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn actions_translate_per_contract() {
		assert_eq!(translate_action(FILE_ACTION_ADDED), ChangeType::Created);
		assert_eq!(
			translate_action(FILE_ACTION_RENAMED_NEW_NAME),
			ChangeType::Created
		);
		assert_eq!(translate_action(FILE_ACTION_REMOVED), ChangeType::Removed);
		assert_eq!(
			translate_action(FILE_ACTION_RENAMED_OLD_NAME),
			ChangeType::Removed
		);
		assert_eq!(translate_action(FILE_ACTION_MODIFIED), ChangeType::Modified);
		assert_eq!(translate_action(FILE_ACTION(0x4000)), ChangeType::Unknown);
	}

	#[test]
	fn canonical_forms_split_os_and_host_views() {
		let long = format!(r"C:\{}", "a".repeat(300));
		let (canonical, root) = canonical_forms(Path::new(&long));
		assert!(canonical.to_str().unwrap().starts_with(r"\\?\C:\"));
		assert_eq!(root, PathBuf::from(&long));
	}
}
