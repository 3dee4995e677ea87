//! Cross-thread command channel between caller threads and the watcher thread
//!
//! The queue is the only mutable structure shared across threads. Caller
//! threads enqueue commands and block on a per-command completion signal; the
//! watcher thread drains the queue and executes commands serially, storing
//! any failure in the command's result slot before signalling completion.
//! Once `Terminate` has executed the queue is closed: commands submitted
//! afterwards are never executed, so their submitters run into the command
//! timeout, which is the contract for racing against shutdown.

use std::{
	collections::VecDeque,
	path::PathBuf,
	sync::Arc,
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, WatcherError};

/// Executed on the watcher thread, in submission order.
#[derive(Debug)]
pub(crate) enum Command {
	RegisterPaths(Vec<PathBuf>),
	UnregisterPaths(Vec<PathBuf>),
	Terminate,
}

/// Successful result of an executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandOutcome {
	Done,
	/// Whether every path handed to `UnregisterPaths` was actually watched.
	Unwatched(bool),
}

#[derive(Default)]
struct SubmissionSlot {
	result: Option<Result<CommandOutcome>>,
}

/// Completion signal plus failure slot for one submitted command.
pub(crate) struct Submission {
	slot: Mutex<SubmissionSlot>,
	completed: Condvar,
}

impl Submission {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			slot: Mutex::new(SubmissionSlot::default()),
			completed: Condvar::new(),
		})
	}

	/// Stores the result and wakes the submitter. Completing twice is a
	/// logic error; the first result wins.
	pub(crate) fn complete(&self, result: Result<CommandOutcome>) {
		let mut slot = self.slot.lock();
		if slot.result.is_none() {
			slot.result = Some(result);
		}
		self.completed.notify_all();
	}

	/// Blocks the submitter until the watcher thread completes the command,
	/// bounded by `timeout`.
	pub(crate) fn wait(&self, timeout: Duration) -> Result<CommandOutcome> {
		let deadline = Instant::now() + timeout;
		let mut slot = self.slot.lock();

		while slot.result.is_none() {
			if self.completed.wait_until(&mut slot, deadline).timed_out() {
				// The command may still execute later; the watcher thread is
				// not disturbed.
				return slot
					.result
					.take()
					.unwrap_or(Err(WatcherError::CommandTimeout(timeout)));
			}
		}

		slot.result
			.take()
			.expect("submission signalled without a result")
	}
}

pub(crate) struct PendingCommand {
	pub(crate) command: Command,
	pub(crate) submission: Arc<Submission>,
}

struct QueueState {
	commands: VecDeque<PendingCommand>,
	closed: bool,
}

/// FIFO command queue protected by a single mutex.
///
/// Submissions from one thread keep their relative order; no total order is
/// promised across threads.
pub(crate) struct CommandQueue {
	state: Mutex<QueueState>,
}

impl CommandQueue {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(QueueState {
				commands: VecDeque::new(),
				closed: false,
			}),
		})
	}

	/// Enqueues a command and hands back the submission to wait on. On a
	/// closed queue the command is dropped and the submission never
	/// completes, so the submitter times out.
	pub(crate) fn submit(&self, command: Command) -> Arc<Submission> {
		let submission = Submission::new();
		let mut state = self.state.lock();
		if !state.closed {
			state.commands.push_back(PendingCommand {
				command,
				submission: Arc::clone(&submission),
			});
		}
		submission
	}

	/// Takes the oldest pending command. Watcher thread only.
	pub(crate) fn pop(&self) -> Option<PendingCommand> {
		self.state.lock().commands.pop_front()
	}

	/// Closes the queue after `Terminate` has executed. Commands still
	/// queued are discarded; their submitters time out.
	pub(crate) fn close(&self) {
		let mut state = self.state.lock();
		state.closed = true;
		state.commands.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	#[test]
	fn completed_command_returns_result() {
		let queue = CommandQueue::new();
		let submission = queue.submit(Command::RegisterPaths(vec![]));

		let pending = queue.pop().expect("command was queued");
		pending.submission.complete(Ok(CommandOutcome::Done));

		assert_eq!(
			submission.wait(Duration::from_millis(100)).unwrap(),
			CommandOutcome::Done
		);
	}

	#[test]
	fn failure_is_carried_to_the_submitter() {
		let queue = CommandQueue::new();
		let submission = queue.submit(Command::UnregisterPaths(vec![]));

		let pending = queue.pop().unwrap();
		pending
			.submission
			.complete(Err(WatcherError::AlreadyWatching("/tmp/x".into())));

		assert!(matches!(
			submission.wait(Duration::from_millis(100)),
			Err(WatcherError::AlreadyWatching(_))
		));
	}

	#[test]
	fn unserviced_command_times_out() {
		let queue = CommandQueue::new();
		let submission = queue.submit(Command::Terminate);

		assert!(matches!(
			submission.wait(Duration::from_millis(50)),
			Err(WatcherError::CommandTimeout(_))
		));
	}

	#[test]
	fn submissions_after_close_time_out() {
		let queue = CommandQueue::new();
		queue.close();

		let submission = queue.submit(Command::RegisterPaths(vec!["/tmp/x".into()]));
		assert!(queue.pop().is_none());
		assert!(matches!(
			submission.wait(Duration::from_millis(50)),
			Err(WatcherError::CommandTimeout(_))
		));
	}

	#[test]
	fn commands_drain_in_submission_order() {
		let queue = CommandQueue::new();
		queue.submit(Command::RegisterPaths(vec!["/tmp/a".into()]));
		queue.submit(Command::UnregisterPaths(vec!["/tmp/a".into()]));
		queue.submit(Command::Terminate);

		assert!(matches!(
			queue.pop().unwrap().command,
			Command::RegisterPaths(_)
		));
		assert!(matches!(
			queue.pop().unwrap().command,
			Command::UnregisterPaths(_)
		));
		assert!(matches!(queue.pop().unwrap().command, Command::Terminate));
		assert!(queue.pop().is_none());
	}

	#[test]
	fn waiting_submitter_is_woken_from_another_thread() {
		let queue = CommandQueue::new();
		let submission = queue.submit(Command::RegisterPaths(vec![]));

		let worker = thread::spawn({
			let queue = Arc::clone(&queue);
			move || {
				let pending = queue.pop().unwrap();
				thread::sleep(Duration::from_millis(20));
				pending.submission.complete(Ok(CommandOutcome::Unwatched(true)));
			}
		});

		assert_eq!(
			submission.wait(Duration::from_secs(1)).unwrap(),
			CommandOutcome::Unwatched(true)
		);
		worker.join().unwrap();
	}
}
