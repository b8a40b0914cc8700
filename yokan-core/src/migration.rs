//! The migration handle (spec §2 item 5, §4.9, §8 property 9).
//!
//! A scoped object obtained from an engine; while it is alive the engine
//! refuses concurrent mutations, and the handle exposes the engine's file
//! list relative to a root directory. On drop it marks the engine
//! migrated (every call but `destroy` then returns `Migrated`) unless
//! `cancel()` was called first, in which case the engine is left exactly
//! as it was.

use crate::backend::{Backend, FileList};
use crate::status::{Result, Status};
use std::path::{Path, PathBuf};

pub struct MigrationHandle<'a> {
	engine: &'a dyn Backend,
	files: FileList,
	canceled: bool,
	committed: bool,
}

impl<'a> MigrationHandle<'a> {
	/// Starts a migration against `engine`, flushing its state under
	/// `root`. Returns `NotSupported` for memory-only engines with no
	/// on-disk representation.
	pub fn start(engine: &'a dyn Backend, root: &Path) -> Result<Self> {
		let files = engine.start_migration(root)?;
		Ok(MigrationHandle { engine, files, canceled: false, committed: false })
	}

	pub fn get_root(&self) -> &Path {
		&self.files.root
	}

	pub fn get_files(&self) -> &[PathBuf] {
		&self.files.files
	}

	/// Leaves the engine usable; the migration never happened as far as
	/// subsequent callers can tell.
	pub fn cancel(mut self) {
		self.canceled = true;
		self.engine.cancel_migration();
		self.committed = true;
	}
}

impl<'a> Drop for MigrationHandle<'a> {
	fn drop(&mut self) {
		if !self.committed {
			if self.canceled {
				self.engine.cancel_migration();
			} else {
				self.engine.mark_migrated();
			}
		}
	}
}

/// Helper for `recover`: rewrites configuration parameters that are
/// inconsistent with in-place recovery (e.g. `create` mode) to their
/// in-place equivalents (spec §4.9 "Recovery at the receiving side").
pub fn sanitize_recovery_mode(mode: &str) -> &'static str {
	match mode {
		"create" => "read_write",
		"mmap" => "mmap",
		"memory" => "memory",
		"read_only" => "read_only",
		_ => "read_write",
	}
}

/// Returns `Status::Migrated` if `migrated` is set; used by engines at the
/// top of every operation once a migration has committed.
pub fn guard_migrated(migrated: bool) -> Result<()> {
	if migrated {
		Err(Status::Migrated)
	} else {
		Ok(())
	}
}
