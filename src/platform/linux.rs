//! Linux backend: a single inotify descriptor shared by every watch root
//!
//! The watcher thread multiplexes the inotify fd and an eventfd wake-up with
//! `poll(2)`. Commands trigger the eventfd; the kernel queues change records
//! on the inotify fd. Everything is drained on the watcher thread, so the
//! watch-point maps need no locking. inotify watches are not recursive:
//! clients that want subtree coverage register directories as they appear,
//! which is why a freshly created subdirectory is reported as `Created`
//! before anything inside it can be observed.

use std::{
	collections::HashMap,
	ffi::OsString,
	io, mem,
	os::unix::io::{AsRawFd, RawFd},
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use tracing::{debug, error, trace, warn};

use crate::{
	command::{Command, CommandOutcome, CommandQueue},
	error::{Result, WatcherError},
	event::ChangeType,
	platform::WatchPointStatus,
	server::{Handshake, ServerConfig, WatcherThread},
	sink::EventSink,
};

/// Large enough for a full batch of records with long file names.
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MODIFY
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::ATTRIB
		| WatchMask::CLOSE_WRITE
		| WatchMask::MOVE_SELF
		| WatchMask::DELETE_SELF
		| WatchMask::EXCL_UNLINK
}

/// Wake-up channel for command delivery, multiplexed with the inotify fd.
struct EventFd {
	fd: RawFd,
}

impl EventFd {
	fn new() -> Result<Self> {
		let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
		if fd < 0 {
			return Err(WatcherError::Startup {
				reason: format!("eventfd failed: {}", io::Error::last_os_error()),
			});
		}
		Ok(Self { fd })
	}

	fn trigger(&self) -> io::Result<()> {
		let value = 1u64;
		let written = unsafe {
			libc::write(
				self.fd,
				&value as *const u64 as *const libc::c_void,
				mem::size_of::<u64>(),
			)
		};
		if written == mem::size_of::<u64>() as isize {
			Ok(())
		} else {
			Err(io::Error::last_os_error())
		}
	}

	/// Clears the counter. A short read just means another drain got there
	/// first.
	fn consume(&self) {
		let mut value = 0u64;
		unsafe {
			libc::read(
				self.fd,
				&mut value as *mut u64 as *mut libc::c_void,
				mem::size_of::<u64>(),
			);
		}
	}
}

impl AsRawFd for EventFd {
	fn as_raw_fd(&self) -> RawFd {
		self.fd
	}
}

impl Drop for EventFd {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.fd);
		}
	}
}

pub(crate) struct PlatformServer {
	wake: Arc<EventFd>,
}

impl PlatformServer {
	pub(crate) fn launch<S: EventSink>(
		sink: S,
		_config: &ServerConfig,
		queue: Arc<CommandQueue>,
	) -> Result<(Self, WatcherThread)> {
		let wake = Arc::new(EventFd::new()?);
		let handshake = Handshake::new();

		let thread = {
			let wake = Arc::clone(&wake);
			let handshake = Arc::clone(&handshake);
			WatcherThread::spawn("fs-events watcher", move || {
				let mut server = match LinuxServer::new(sink, wake, queue) {
					Ok(server) => {
						handshake.notify(Ok(()));
						server
					}
					Err(e) => {
						handshake.notify(Err(e));
						return;
					}
				};
				server.run();
			})?
		};

		if let Err(e) = handshake.wait() {
			let _ = thread.join(Duration::from_secs(1));
			return Err(e);
		}

		Ok((Self { wake }, thread))
	}

	pub(crate) fn wake(&self) -> Result<()> {
		self.wake.trigger().map_err(Into::into)
	}
}

struct WatchPoint {
	wd: WatchDescriptor,
	status: WatchPointStatus,
}

/// Record lifted out of the read buffer so the buffer can be reused while
/// the event is dispatched.
struct RawRecord {
	wd: WatchDescriptor,
	mask: EventMask,
	name: Option<OsString>,
}

struct LinuxServer<S> {
	sink: S,
	inotify: Inotify,
	wake: Arc<EventFd>,
	queue: Arc<CommandQueue>,
	watch_points: HashMap<PathBuf, WatchPoint>,
	watch_roots: HashMap<WatchDescriptor, PathBuf>,
	buffer: Vec<u8>,
	terminated: bool,
}

impl<S: EventSink> LinuxServer<S> {
	fn new(sink: S, wake: Arc<EventFd>, queue: Arc<CommandQueue>) -> Result<Self> {
		let inotify = Inotify::init().map_err(|e| WatcherError::Startup {
			reason: format!("inotify_init failed: {e}"),
		})?;

		Ok(Self {
			sink,
			inotify,
			wake,
			queue,
			watch_points: HashMap::new(),
			watch_roots: HashMap::new(),
			buffer: vec![0u8; EVENT_BUFFER_SIZE],
			terminated: false,
		})
	}

	fn run(&mut self) {
		debug!("Watcher thread entering inotify loop");

		while !self.terminated {
			let (events_ready, commands_ready) = match self.wait_for_activity() {
				Ok(ready) => ready,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!(%e, "poll on inotify fd failed, shutting down watcher");
					self.sink.report_error(&e.into());
					break;
				}
			};

			// Commands first, so an unregister never races the events it is
			// trying to stop.
			if commands_ready {
				self.wake.consume();
				self.process_commands();
			}
			if events_ready && !self.terminated {
				self.handle_events();
			}
		}

		self.shutdown();
	}

	fn wait_for_activity(&self) -> io::Result<(bool, bool)> {
		let mut fds = [
			libc::pollfd {
				fd: self.inotify.as_raw_fd(),
				events: libc::POLLIN,
				revents: 0,
			},
			libc::pollfd {
				fd: self.wake.as_raw_fd(),
				events: libc::POLLIN,
				revents: 0,
			},
		];

		let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok((
			fds[0].revents & libc::POLLIN != 0,
			fds[1].revents & libc::POLLIN != 0,
		))
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

	/// Drains one buffer's worth of records; the loop polls again for the
	/// rest, so a busy filesystem cannot starve command processing.
	fn handle_events(&mut self) {
		let mut buffer = mem::take(&mut self.buffer);
		let records = match self.inotify.read_events(&mut buffer) {
			Ok(events) => events
				.map(|event| RawRecord {
					wd: event.wd.clone(),
					mask: event.mask,
					name: event.name.map(|name| name.to_os_string()),
				})
				.collect::<Vec<_>>(),
			// Spurious wake-up, nothing was queued after all.
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Vec::new(),
			Err(e) => {
				self.buffer = buffer;
				error!(%e, "Failed to read inotify events");
				self.sink.report_error(&e.into());
				return;
			}
		};
		self.buffer = buffer;

		for record in records {
			self.handle_event(record);
		}
	}

	fn handle_event(&mut self, record: RawRecord) {
		trace!(mask = ?record.mask, name = ?record.name, "Received inotify event");

		if record.mask.contains(EventMask::Q_OVERFLOW) {
			warn!("inotify event queue overflowed, change records were lost");
			for root in self.watch_points.keys() {
				self.sink.path_changed(ChangeType::Overflow, root);
			}
			return;
		}

		let Some(root) = self.watch_roots.get(&record.wd).cloned() else {
			// Events keep trickling in shortly after a root was unregistered.
			trace!("Dropping event for retired watch descriptor");
			return;
		};

		if record.mask.contains(EventMask::IGNORED) {
			// The kernel retires the watch itself once the root is gone.
			self.retire(&root);
			return;
		}

		if record
			.mask
			.intersects(EventMask::MOVE_SELF | EventMask::DELETE_SELF)
		{
			debug!(root = %root.display(), "Watch root is gone");
			if let Some(point) = self.watch_points.get_mut(&root) {
				point.status = WatchPointStatus::Finished;
			}
			self.sink.path_changed(ChangeType::Invalidated, &root);
			return;
		}

		if let Some(point) = self.watch_points.get(&root) {
			if point.status != WatchPointStatus::Listening {
				trace!(root = %root.display(), status = ?point.status, "Dropping event for inactive watch point");
				return;
			}
		}

		let path = match record.name {
			Some(name) => root.join(name),
			None => root,
		};
		self.sink.path_changed(translate_mask(record.mask), &path);
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

			let wd = self
				.inotify
				.watches()
				.add(path, watch_mask())
				.map_err(|e| WatcherError::WatchFailed {
					path: path.clone(),
					reason: e.to_string(),
				})?;

			self.watch_roots.insert(wd.clone(), path.clone());
			self.watch_points.insert(
				path.clone(),
				WatchPoint {
					wd,
					status: WatchPointStatus::Listening,
				},
			);
			debug!(root = %path.display(), "Now watching root");
		}
		Ok(CommandOutcome::Done)
	}

	fn unregister(&mut self, paths: &[PathBuf]) -> Result<CommandOutcome> {
		let mut all_watched = true;
		for path in paths {
			let Some(mut point) = self.watch_points.remove(path) else {
				debug!(path = %path.display(), "Path is not watched");
				all_watched = false;
				continue;
			};
			self.watch_roots.remove(&point.wd);

			if point.status == WatchPointStatus::Listening {
				point.status = WatchPointStatus::Cancelled;
				trace!(root = %path.display(), status = ?point.status, "Cancelling kernel watch");
				if let Err(e) = self.inotify.watches().remove(point.wd.clone()) {
					// Expected when the kernel already dropped the watch
					// because the root disappeared.
					debug!(root = %path.display(), %e, "Failed to remove kernel watch");
				}
			}
			debug!(root = %path.display(), "Stopped watching root");
		}
		Ok(CommandOutcome::Unwatched(all_watched))
	}

	fn retire(&mut self, root: &Path) {
		if let Some(point) = self.watch_points.remove(root) {
			self.watch_roots.remove(&point.wd);
			debug!(root = %root.display(), "Watch point retired by the kernel");
		}
	}

	fn shutdown(&mut self) {
		debug!("Shutting down inotify watcher");

		let points = self.watch_points.drain().collect::<Vec<_>>();
		for (root, point) in points {
			self.watch_roots.remove(&point.wd);
			if point.status == WatchPointStatus::Listening {
				if let Err(e) = self.inotify.watches().remove(point.wd.clone()) {
					debug!(root = %root.display(), %e, "Failed to remove watch during shutdown");
				}
			}
		}
		// The inotify fd and the eventfd close on drop.
	}
}

fn translate_mask(mask: EventMask) -> ChangeType {
	if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
		ChangeType::Created
	} else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
		ChangeType::Removed
	} else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB | EventMask::CLOSE_WRITE) {
		ChangeType::Modified
	} else {
		ChangeType::Unknown
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn creation_masks_translate_to_created() {
		assert_eq!(translate_mask(EventMask::CREATE), ChangeType::Created);
		assert_eq!(translate_mask(EventMask::MOVED_TO), ChangeType::Created);
		// A directory creation keeps the same classification.
		assert_eq!(
			translate_mask(EventMask::CREATE | EventMask::ISDIR),
			ChangeType::Created
		);
	}

	#[test]
	fn removal_masks_translate_to_removed() {
		assert_eq!(translate_mask(EventMask::DELETE), ChangeType::Removed);
		assert_eq!(translate_mask(EventMask::MOVED_FROM), ChangeType::Removed);
		assert_eq!(
			translate_mask(EventMask::DELETE | EventMask::ISDIR),
			ChangeType::Removed
		);
	}

	#[test]
	fn modification_masks_translate_to_modified() {
		assert_eq!(translate_mask(EventMask::MODIFY), ChangeType::Modified);
		assert_eq!(translate_mask(EventMask::ATTRIB), ChangeType::Modified);
		assert_eq!(translate_mask(EventMask::CLOSE_WRITE), ChangeType::Modified);
	}

	#[test]
	fn unrecognized_masks_translate_to_unknown() {
		assert_eq!(translate_mask(EventMask::OPEN), ChangeType::Unknown);
		assert_eq!(translate_mask(EventMask::empty()), ChangeType::Unknown);
	}
}
