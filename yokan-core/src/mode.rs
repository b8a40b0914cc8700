//! The 32-bit mode bitmask passed to nearly every operation (spec §4.2).

/// `listKeys`/`listKeyValues`/`docList` include the starting key/id when found.
pub const INCLUSIVE: u32 = 1 << 0;
/// `put` concatenates to any existing value instead of replacing.
pub const APPEND: u32 = 1 << 1;
/// `get` also erases the returned keys after copying.
pub const CONSUME: u32 = 1 << 2;
/// Lookup of a missing key blocks until it appears.
pub const WAIT: u32 = 1 << 3;
/// `put` wakes waiters on the written key. Shares bit 3 with `WAIT`: the two
/// are never meaningful on the same call (`WAIT` only applies to read-side
/// operations, `NOTIFY` only to `put`), so the bit is reused per spec §4.2.
pub const NOTIFY: u32 = 1 << 3;
/// `put` rejects an existing key with `KeyExists`.
pub const NEW_ONLY: u32 = 1 << 4;
/// `put` only updates keys that already exist.
pub const EXIST_ONLY: u32 = 1 << 5;
/// Iteration strips the filter's prefix/suffix from returned keys.
pub const NO_PREFIX: u32 = 1 << 6;
/// `listKeyValues` returns empty keys.
pub const IGNORE_KEYS: u32 = 1 << 7;
/// Implies `IGNORE_KEYS` but the last-returned key is kept intact.
pub const KEEP_LAST: u32 = (1 << 7) | (1 << 8);
/// The filter argument is a suffix, not a prefix.
pub const SUFFIX: u32 = 1 << 9;
/// The filter argument is an embedded-scripting predicate.
pub const LUA_FILTER: u32 = 1 << 10;
/// `docList` returns ids only.
pub const IGNORE_DOCS: u32 = 1 << 11;
/// Filter predicate consumes the value (otherwise engines may skip value load).
pub const FILTER_VALUE: u32 = 1 << 12;
/// The filter argument names a dynamically loaded filter as `lib:name:args`.
pub const LIB_FILTER: u32 = 1 << 13;
/// Transport hint, opaque to the core.
pub const NO_RDMA: u32 = 1 << 14;
/// `docUpdate` may create a document at an id beyond `last_id`, padding gaps
/// with tombstones.
pub const UPDATE_NEW: u32 = 1 << 15;

/// A mode bitmask together with the query helpers engines use to decide
/// what a caller is asking for. Kept as a thin newtype over `u32` rather
/// than a `bitflags!` struct because `KEEP_LAST`/`IGNORE_KEYS` and
/// `WAIT`/`NOTIFY` overlap bits in ways `bitflags` validation would fight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode(pub u32);

impl Mode {
	pub const NONE: Mode = Mode(0);

	pub fn new(bits: u32) -> Self {
		Mode(bits)
	}

	pub fn has(self, bits: u32) -> bool {
		self.0 & bits == bits
	}

	pub fn inclusive(self) -> bool {
		self.has(INCLUSIVE)
	}
	pub fn append(self) -> bool {
		self.has(APPEND)
	}
	pub fn consume(self) -> bool {
		self.has(CONSUME)
	}
	pub fn wait(self) -> bool {
		self.has(WAIT)
	}
	pub fn notify(self) -> bool {
		self.has(NOTIFY)
	}
	pub fn new_only(self) -> bool {
		self.has(NEW_ONLY)
	}
	pub fn exist_only(self) -> bool {
		self.has(EXIST_ONLY)
	}
	pub fn no_prefix(self) -> bool {
		self.has(NO_PREFIX)
	}
	pub fn keep_last(self) -> bool {
		self.has(KEEP_LAST)
	}
	pub fn ignore_keys(self) -> bool {
		self.has(IGNORE_KEYS)
	}
	pub fn suffix(self) -> bool {
		self.has(SUFFIX)
	}
	pub fn lua_filter(self) -> bool {
		self.has(LUA_FILTER)
	}
	pub fn ignore_docs(self) -> bool {
		self.has(IGNORE_DOCS)
	}
	pub fn filter_value(self) -> bool {
		self.has(FILTER_VALUE)
	}
	pub fn lib_filter(self) -> bool {
		self.has(LIB_FILTER)
	}
	pub fn update_new(self) -> bool {
		self.has(UPDATE_NEW)
	}

	/// Checks `self` against a bitmask of bits a backend is willing to
	/// honor; returns `false` if `self` sets any bit outside that mask.
	pub fn supported_by(self, supported: u32) -> bool {
		self.0 & !supported == 0
	}
}

impl From<u32> for Mode {
	fn from(bits: u32) -> Self {
		Mode(bits)
	}
}
