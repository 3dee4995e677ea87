use std::{
	fs,
	io::Write,
	path::{Path, PathBuf},
	sync::mpsc::{self, Receiver, RecvTimeoutError},
	thread,
	time::{Duration, Instant},
};

use fs_events::{ChangeEvent, ChangeType, ServerConfig, WatchServer, WatcherError};
use tempfile::TempDir;
use tracing_test::traced_test;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough to cover platform latency when asserting that nothing
/// arrives.
const QUIET_PERIOD: Duration = Duration::from_millis(700);

fn setup_watcher() -> (TempDir, PathBuf, WatchServer, Receiver<ChangeEvent>) {
	let dir = tempfile::tempdir().expect("Failed to create temp root");
	// The OS reports resolved paths, so watch the canonical form.
	let root = dir
		.path()
		.canonicalize()
		.expect("Failed to canonicalize temp root");

	let (tx, rx) = mpsc::channel();
	let server = WatchServer::new(tx, ServerConfig::default()).expect("Failed to start server");

	(dir, root, server, rx)
}

fn expect_event(rx: &Receiver<ChangeEvent>, change: ChangeType, path: &Path) {
	let deadline = Instant::now() + EVENT_TIMEOUT;
	let mut seen = Vec::new();

	while Instant::now() < deadline {
		match rx.recv_timeout(Duration::from_millis(100)) {
			Ok(event) => {
				if event.change == change && event.path == path {
					return;
				}
				seen.push(event);
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}

	panic!(
		"Did not receive {change:?} for {}; other events seen: {seen:?}",
		path.display()
	);
}

/// Waits until every expected event arrived, in any order, tolerating
/// unrelated events in between.
fn expect_events_unordered(rx: &Receiver<ChangeEvent>, mut expected: Vec<ChangeEvent>) {
	let deadline = Instant::now() + EVENT_TIMEOUT;
	let mut seen = Vec::new();

	while !expected.is_empty() && Instant::now() < deadline {
		match rx.recv_timeout(Duration::from_millis(100)) {
			Ok(event) => {
				if let Some(position) = expected.iter().position(|e| *e == event) {
					expected.remove(position);
				} else {
					seen.push(event);
				}
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}

	assert!(
		expected.is_empty(),
		"Missing events: {expected:?}; other events seen: {seen:?}"
	);
}

fn expect_no_events(rx: &Receiver<ChangeEvent>) {
	match rx.recv_timeout(QUIET_PERIOD) {
		Ok(event) => panic!("Expected no events, received {event:?}"),
		Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
	}
}

#[test]
#[traced_test]
fn create_modify_delete_yields_matching_events() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	let file = root.join("a.txt");
	fs::write(&file, "x").unwrap();
	expect_event(&rx, ChangeType::Created, &file);

	let mut open = fs::OpenOptions::new().append(true).open(&file).unwrap();
	open.write_all(b"more").unwrap();
	open.sync_all().unwrap();
	drop(open);
	expect_event(&rx, ChangeType::Modified, &file);

	fs::remove_file(&file).unwrap();
	expect_event(&rx, ChangeType::Removed, &file);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn rename_within_root_yields_removed_and_created() {
	let (_dir, root, mut server, rx) = setup_watcher();

	let from = root.join("a.txt");
	let to = root.join("b.txt");
	fs::write(&from, "x").unwrap();

	server.start_watching(vec![root.clone()]).unwrap();
	fs::rename(&from, &to).unwrap();

	// Order is platform-dependent, so accept either.
	expect_events_unordered(
		&rx,
		vec![
			ChangeEvent {
				change: ChangeType::Removed,
				path: from,
			},
			ChangeEvent {
				change: ChangeType::Created,
				path: to,
			},
		],
	);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn events_follow_registered_subdirectories() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	let sub = root.join("sub");
	fs::create_dir(&sub).unwrap();
	expect_event(&rx, ChangeType::Created, &sub);

	// Watches are per-directory; clients register subdirectories as they
	// appear.
	server.start_watching(vec![sub.clone()]).unwrap();

	let file = sub.join("c.txt");
	fs::write(&file, "x").unwrap();
	expect_event(&rx, ChangeType::Created, &file);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn double_registration_fails_and_server_stays_usable() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	assert!(matches!(
		server.start_watching(vec![root.clone()]),
		Err(WatcherError::AlreadyWatching(_))
	));

	// Registering the same path twice within one call fails the same way.
	let other = root.join("other");
	fs::create_dir(&other).unwrap();
	expect_event(&rx, ChangeType::Created, &other);
	assert!(matches!(
		server.start_watching(vec![other.clone(), other.clone()]),
		Err(WatcherError::AlreadyWatching(_))
	));

	let file = root.join("still-works.txt");
	fs::write(&file, "x").unwrap();
	expect_event(&rx, ChangeType::Created, &file);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn unregister_stops_event_delivery() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	assert!(server.stop_watching(vec![root.clone()]).unwrap());

	fs::write(root.join("d.txt"), "x").unwrap();
	expect_no_events(&rx);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn reregistering_a_root_yields_events_again() {
	let (_dir, root, mut server, rx) = setup_watcher();

	server.start_watching(vec![root.clone()]).unwrap();
	assert!(server.stop_watching(vec![root.clone()]).unwrap());
	server.start_watching(vec![root.clone()]).unwrap();

	let file = root.join("back.txt");
	fs::write(&file, "x").unwrap();
	expect_event(&rx, ChangeType::Created, &file);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn no_callback_fires_after_close() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	server.close().unwrap();

	fs::write(root.join("late.txt"), "x").unwrap();
	expect_no_events(&rx);

	// Closing is idempotent, and a closed server rejects new commands.
	server.close().unwrap();
	assert!(matches!(
		server.start_watching(vec![root]),
		Err(WatcherError::Terminated)
	));
}

#[test]
#[traced_test]
fn relative_and_invalid_paths_are_rejected() {
	let (_dir, root, mut server, _rx) = setup_watcher();

	assert!(matches!(
		server.start_watching(vec![PathBuf::from("relative/dir")]),
		Err(WatcherError::NotAbsolute(_))
	));

	assert!(matches!(
		server.start_watching(vec![root.join("does-not-exist")]),
		Err(WatcherError::PathNotFound(_))
	));

	let file = root.join("plain.txt");
	fs::write(&file, "x").unwrap();
	assert!(matches!(
		server.start_watching(vec![file]),
		Err(WatcherError::NotADirectory(_))
	));

	server.close().unwrap();
}

#[test]
#[traced_test]
fn earlier_roots_of_a_failed_batch_stay_registered() {
	let (_dir, root, mut server, rx) = setup_watcher();

	let good = root.join("good");
	fs::create_dir(&good).unwrap();

	assert!(matches!(
		server.start_watching(vec![good.clone(), root.join("missing")]),
		Err(WatcherError::PathNotFound(_))
	));

	let file = good.join("seen.txt");
	fs::write(&file, "x").unwrap();
	expect_event(&rx, ChangeType::Created, &file);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn empty_registration_is_a_noop() {
	let (_dir, _root, mut server, rx) = setup_watcher();

	server.start_watching(vec![]).unwrap();
	assert!(server.stop_watching(vec![]).unwrap());
	expect_no_events(&rx);

	server.close().unwrap();
}

#[test]
#[traced_test]
fn stopping_an_unwatched_path_returns_false() {
	let (_dir, root, mut server, _rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	assert!(!server.stop_watching(vec![root.join("never-watched")]).unwrap());
	// A mixed batch still unregisters the watched root.
	assert!(!server
		.stop_watching(vec![root.clone(), root.join("also-never")])
		.unwrap());

	server.close().unwrap();
}

#[test]
#[traced_test]
fn reported_paths_stay_under_their_root() {
	let (_dir, root, mut server, rx) = setup_watcher();
	server.start_watching(vec![root.clone()]).unwrap();

	fs::write(root.join("one.txt"), "x").unwrap();
	fs::create_dir(root.join("two")).unwrap();
	fs::remove_file(root.join("one.txt")).unwrap();

	let deadline = Instant::now() + Duration::from_secs(2);
	let mut count = 0;
	while Instant::now() < deadline {
		match rx.recv_timeout(Duration::from_millis(100)) {
			Ok(event) => {
				assert!(
					event.path.starts_with(&root),
					"Event path {} escaped root {}",
					event.path.display(),
					root.display()
				);
				assert!(event.path.is_absolute());
				count += 1;
			}
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}
	assert!(count > 0, "Expected at least one event");

	server.close().unwrap();
}

#[test]
#[traced_test]
fn concurrent_submissions_all_complete() {
	let (_dir, root, mut server, rx) = setup_watcher();

	let subs = (0..8)
		.map(|i| {
			let sub = root.join(format!("dir{i}"));
			fs::create_dir(&sub).unwrap();
			sub
		})
		.collect::<Vec<_>>();

	thread::scope(|scope| {
		for sub in &subs {
			let server = &server;
			scope.spawn(move || {
				server.start_watching(vec![sub.clone()]).unwrap();
			});
		}
	});

	for sub in &subs {
		let file = sub.join("f.txt");
		fs::write(&file, "x").unwrap();
		expect_event(&rx, ChangeType::Created, &file);
	}

	assert!(server.stop_watching(subs).unwrap());
	server.close().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
#[traced_test]
fn deleting_the_watched_root_invalidates_it() {
	let (_dir, root, mut server, rx) = setup_watcher();

	let watched = root.join("doomed");
	fs::create_dir(&watched).unwrap();
	server.start_watching(vec![watched.clone()]).unwrap();

	fs::remove_dir(&watched).unwrap();
	expect_event(&rx, ChangeType::Invalidated, &watched);

	server.close().unwrap();
}
