//! Status taxonomy (spec §4.1) and the reserved size sentinels.

use std::fmt;

/// Result of a Yokan operation. Mirrors the status codes a C client would
/// see across the RPC boundary; `Ok(T)` stands in for the `OK` status with
/// its payload, everything else is a member of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
	#[error("invalid type")]
	InvalidType,
	#[error("invalid configuration")]
	InvalidConf,
	#[error("invalid argument")]
	InvalidArg,
	#[error("invalid id")]
	InvalidID,
	#[error("not found")]
	NotFound,
	#[error("size error")]
	SizeError,
	#[error("key already exists")]
	KeyExists,
	#[error("operation not supported by this backend")]
	NotSupported,
	#[error("on-disk corruption detected")]
	Corruption,
	#[error("I/O error")]
	IOError,
	#[error("incomplete operation")]
	Incomplete,
	#[error("operation timed out")]
	TimedOut,
	#[error("operation aborted")]
	Aborted,
	#[error("resource busy")]
	Busy,
	#[error("expired")]
	Expired,
	#[error("try again")]
	TryAgain,
	#[error("system error")]
	System,
	#[error("canceled")]
	Canceled,
	#[error("permission denied")]
	Permission,
	#[error("invalid mode bits for this operation")]
	InvalidMode,
	#[error("engine has been migrated away")]
	Migrated,
	#[error("iteration stopped by filter or callback")]
	StopIteration,
	#[error("other error: {0}")]
	Other(&'static str),
}

pub type Result<T> = std::result::Result<T, Status>;

/// Per-element size sentinels that appear in output size arrays. A caller
/// must treat any size `>= SIZE_SENTINEL_FLOOR` as one of these rather than
/// as a real length (spec §4.1, §6).
pub const KEY_NOT_FOUND: u64 = u64::MAX;
pub const SIZE_TOO_SMALL: u64 = u64::MAX - 1;
pub const NO_MORE_KEYS: u64 = u64::MAX - 2;
pub const NO_MORE_DOCS: u64 = u64::MAX - 2;

/// Lowest sentinel value; any size at or above this is not a real length.
pub const SIZE_SENTINEL_FLOOR: u64 = u64::MAX - 2;

pub fn is_sentinel(size: u64) -> bool {
	size >= SIZE_SENTINEL_FLOOR
}

impl fmt::Display for BackendName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Newtype over a backend's registered name, used by the registry and by
/// error messages so a typo'd backend name prints clearly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendName(pub String);

impl From<&str> for BackendName {
	fn from(s: &str) -> Self {
		BackendName(s.to_owned())
	}
}
