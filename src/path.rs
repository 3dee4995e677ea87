//! Conversion between host-supplied paths and the platform-native form
//!
//! Watch roots are accepted as absolute paths only. On Windows, paths longer
//! than 240 UTF-16 units are rewritten to the extended-length form before
//! they reach the OS, and the prefix is stripped again before any path is
//! reported back to the host. The rewrite logic operates on the string form
//! so the same code is exercised on every platform.

use std::path::Path;

use crate::error::{Result, WatcherError};

/// Some Win32 directory APIs fall over well before `MAX_PATH`; rewriting at
/// 240 units covers both limits with one threshold.
const LONG_PATH_THRESHOLD: usize = 240;

const LONG_PATH_PREFIX: &str = r"\\?\";
const UNC_LONG_PATH_PREFIX: &str = r"\\?\UNC\";

pub(crate) fn ensure_absolute(path: &Path) -> Result<()> {
	if path.is_absolute() {
		Ok(())
	} else {
		Err(WatcherError::NotAbsolute(path.to_path_buf()))
	}
}

/// `C:\...` style drive-letter path.
fn is_absolute_local_path(path: &str) -> bool {
	let mut chars = path.chars();
	matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
		&& chars.next() == Some(':')
		&& chars.next() == Some('\\')
}

/// `\\server\share\...` style UNC path.
fn is_absolute_unc_path(path: &str) -> bool {
	path.len() >= 3 && path.starts_with(r"\\") && !path.starts_with(LONG_PATH_PREFIX)
}

fn is_long_path(path: &str) -> bool {
	path.starts_with(LONG_PATH_PREFIX)
}

fn is_unc_long_path(path: &str) -> bool {
	path.starts_with(UNC_LONG_PATH_PREFIX)
}

/// Rewrites a Windows path to the extended-length form when it is too long
/// for the classic Win32 limits. Short paths, already-prefixed paths and
/// unrecognized forms pass through untouched.
pub fn to_extended_length(path: &str) -> String {
	if path.encode_utf16().count() <= LONG_PATH_THRESHOLD || is_long_path(path) {
		return path.to_owned();
	}

	if is_absolute_local_path(path) {
		// C:\... -> \\?\C:\...
		format!("{LONG_PATH_PREFIX}{path}")
	} else if is_absolute_unc_path(path) {
		// \\server\share\... -> \\?\UNC\server\share\...
		format!("{UNC_LONG_PATH_PREFIX}{}", &path[2..])
	} else {
		path.to_owned()
	}
}

/// Strips the extended-length prefix from a path before it is reported to
/// the host.
pub fn strip_extended_length(path: &str) -> String {
	if is_unc_long_path(path) {
		// \\?\UNC\server\share\... -> \\server\share\...
		format!(r"\\{}", &path[UNC_LONG_PATH_PREFIX.len()..])
	} else if is_long_path(path) {
		// \\?\C:\... -> C:\...
		path[LONG_PATH_PREFIX.len()..].to_owned()
	} else {
		path.to_owned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn long_drive_path() -> String {
		format!(r"C:\{}", "a".repeat(300))
	}

	fn long_unc_path() -> String {
		format!(r"\\server\share\{}", "a".repeat(300))
	}

	#[test]
	fn short_paths_pass_through() {
		assert_eq!(to_extended_length(r"C:\short"), r"C:\short");
		assert_eq!(to_extended_length(r"\\server\share"), r"\\server\share");
	}

	#[test]
	fn long_drive_path_gets_prefixed() {
		let path = long_drive_path();
		let extended = to_extended_length(&path);
		assert_eq!(extended, format!(r"\\?\{path}"));
	}

	#[test]
	fn long_unc_path_gets_unc_prefix() {
		let path = long_unc_path();
		let extended = to_extended_length(&path);
		assert!(extended.starts_with(r"\\?\UNC\server\share\"));
	}

	#[test]
	fn already_prefixed_path_is_untouched() {
		let path = format!(r"\\?\C:\{}", "a".repeat(300));
		assert_eq!(to_extended_length(&path), path);
	}

	#[test]
	fn unrecognized_long_form_is_untouched() {
		let path = format!("/unix/{}", "a".repeat(300));
		assert_eq!(to_extended_length(&path), path);
	}

	#[test]
	fn strip_reverses_rewrite() {
		let drive = long_drive_path();
		assert_eq!(strip_extended_length(&to_extended_length(&drive)), drive);

		let unc = long_unc_path();
		assert_eq!(strip_extended_length(&to_extended_length(&unc)), unc);

		assert_eq!(strip_extended_length(r"C:\short"), r"C:\short");
	}

	#[test]
	fn relative_paths_are_rejected() {
		assert!(matches!(
			ensure_absolute(Path::new("relative/dir")),
			Err(WatcherError::NotAbsolute(_))
		));
		assert!(ensure_absolute(&std::env::temp_dir()).is_ok());
	}
}
