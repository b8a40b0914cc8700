//! Filter layer (spec §4.5): `KeyValueFilter` / `DocFilter`, the built-in
//! prefix/suffix filters, and the adapter that lets a `DocFilter` drive a
//! key/value iteration over the document-store mixin's encoded keyspace.

use crate::mode::Mode;
use crate::status::{Result, Status};

/// A predicate plus copy policy applied during key/value iteration.
///
/// `requiresValue` lets engines that can return keys without materializing
/// values (e.g. an embedded ordered engine walking an index) skip the value
/// load entirely for filters that don't need it.
pub trait KeyValueFilter: Send + Sync {
	/// Whether `key`/`val` should be included in the scan's output.
	fn check(&self, key: &[u8], val: &[u8]) -> bool;

	/// Size of the key as it would be copied out (after any prefix/suffix
	/// stripping), without materializing the copy.
	fn key_size_from(&self, key: &[u8]) -> usize {
		key.len()
	}

	/// Size of the value as it would be copied out.
	fn val_size_from(&self, val: &[u8]) -> usize {
		val.len()
	}

	/// Produces the bytes to emit for `key` (e.g. stripped of a prefix
	/// under `NO_PREFIX`).
	fn key_copy(&self, key: &[u8]) -> Vec<u8> {
		key.to_vec()
	}

	/// Produces the bytes to emit for `val`.
	fn val_copy(&self, val: &[u8]) -> Vec<u8> {
		val.to_vec()
	}

	/// Whether an ordered scan may stop once it has moved past `key`
	/// (e.g. a prefix filter that knows `key` is no longer in range).
	fn should_stop(&self, _key: &[u8]) -> bool {
		false
	}

	/// Whether `check` actually looks at the value; an engine may use this
	/// to avoid loading values it would otherwise skip.
	fn requires_value(&self) -> bool {
		true
	}
}

/// The document-store analogue of `KeyValueFilter`.
pub trait DocFilter: Send + Sync {
	fn check(&self, id: u64, doc: &[u8]) -> bool;

	fn doc_size_from(&self, doc: &[u8]) -> usize {
		doc.len()
	}

	fn doc_copy(&self, doc: &[u8]) -> Vec<u8> {
		doc.to_vec()
	}

	fn should_stop(&self, _id: u64) -> bool {
		false
	}

	fn requires_value(&self) -> bool {
		true
	}
}

/// Accepts every key/value unconditionally; the default when no filter
/// argument is supplied.
pub struct MatchAllFilter;

impl KeyValueFilter for MatchAllFilter {
	fn check(&self, _key: &[u8], _val: &[u8]) -> bool {
		true
	}
	fn requires_value(&self) -> bool {
		false
	}
}

impl DocFilter for MatchAllFilter {
	fn check(&self, _id: u64, _doc: &[u8]) -> bool {
		true
	}
	fn requires_value(&self) -> bool {
		false
	}
}

/// Matches keys starting with a fixed prefix; under `NO_PREFIX` the
/// prefix is stripped from copied keys, and the scan can stop as soon as
/// the cursor moves past the prefix's range (spec §8 property 4 and 6).
pub struct PrefixFilter {
	prefix: Vec<u8>,
	strip: bool,
}

impl PrefixFilter {
	pub fn new(prefix: Vec<u8>, strip: bool) -> Self {
		PrefixFilter { prefix, strip }
	}
}

impl KeyValueFilter for PrefixFilter {
	fn check(&self, key: &[u8], _val: &[u8]) -> bool {
		key.starts_with(&self.prefix)
	}

	fn key_size_from(&self, key: &[u8]) -> usize {
		self.key_copy(key).len()
	}

	fn key_copy(&self, key: &[u8]) -> Vec<u8> {
		if self.strip && key.len() >= self.prefix.len() {
			key[self.prefix.len()..].to_vec()
		} else {
			key.to_vec()
		}
	}

	fn should_stop(&self, key: &[u8]) -> bool {
		!key.starts_with(&self.prefix) && key.as_ref() > self.prefix.as_slice()
	}

	fn requires_value(&self) -> bool {
		false
	}
}

/// Matches keys ending with a fixed suffix (mode bit `SUFFIX`).
pub struct SuffixFilter {
	suffix: Vec<u8>,
	strip: bool,
}

impl SuffixFilter {
	pub fn new(suffix: Vec<u8>, strip: bool) -> Self {
		SuffixFilter { suffix, strip }
	}
}

impl KeyValueFilter for SuffixFilter {
	fn check(&self, key: &[u8], _val: &[u8]) -> bool {
		key.ends_with(&self.suffix)
	}

	fn key_size_from(&self, key: &[u8]) -> usize {
		self.key_copy(key).len()
	}

	fn key_copy(&self, key: &[u8]) -> Vec<u8> {
		if self.strip && key.len() >= self.suffix.len() {
			key[..key.len() - self.suffix.len()].to_vec()
		} else {
			key.to_vec()
		}
	}

	fn requires_value(&self) -> bool {
		false
	}
}

/// A predicate that consumes the value as well as the key; used for
/// `FILTER_VALUE`-style filters where the value can't be skipped. Embedded
/// scripting (`LUA_FILTER`) is represented abstractly as one of these: a
/// deployment without a scripting runtime registers no such filter and the
/// factory returns `NotSupported` (design note "Embedded scripting
/// predicate").
pub struct ValuePredicateFilter<F: Fn(&[u8], &[u8]) -> bool + Send + Sync> {
	predicate: F,
}

impl<F: Fn(&[u8], &[u8]) -> bool + Send + Sync> ValuePredicateFilter<F> {
	pub fn new(predicate: F) -> Self {
		ValuePredicateFilter { predicate }
	}
}

impl<F: Fn(&[u8], &[u8]) -> bool + Send + Sync> KeyValueFilter for ValuePredicateFilter<F> {
	fn check(&self, key: &[u8], val: &[u8]) -> bool {
		(self.predicate)(key, val)
	}
}

/// Adapts a `DocFilter` into a `KeyValueFilter` by interpreting the
/// mixin's `<collection-name>\0<big-endian-id>` key layout (spec §4.5).
pub struct DocFilterAdapter<'f> {
	collection: Vec<u8>,
	inner: &'f dyn DocFilter,
}

impl<'f> DocFilterAdapter<'f> {
	pub fn new(collection: &[u8], inner: &'f dyn DocFilter) -> Self {
		DocFilterAdapter { collection: collection.to_vec(), inner }
	}

	/// Extracts `(collection-relative suffix stripped, id)` from a mixin
	/// document key, or `None` if `key` isn't inside `self.collection`.
	pub fn split_key(&self, key: &[u8]) -> Option<u64> {
		let prefix_len = self.collection.len() + 1;
		if key.len() < prefix_len + 8 || &key[..self.collection.len()] != self.collection.as_slice() {
			return None;
		}
		if key[self.collection.len()] != 0 {
			return None;
		}
		let mut id_bytes = [0u8; 8];
		id_bytes.copy_from_slice(&key[prefix_len..prefix_len + 8]);
		Some(u64::from_be_bytes(id_bytes))
	}
}

impl<'f> KeyValueFilter for DocFilterAdapter<'f> {
	fn check(&self, key: &[u8], val: &[u8]) -> bool {
		match self.split_key(key) {
			Some(id) => self.inner.check(id, val),
			None => false,
		}
	}

	fn key_size_from(&self, key: &[u8]) -> usize {
		key.len()
	}

	fn val_size_from(&self, val: &[u8]) -> usize {
		self.inner.doc_size_from(val)
	}

	fn val_copy(&self, val: &[u8]) -> Vec<u8> {
		self.inner.doc_copy(val)
	}

	fn should_stop(&self, key: &[u8]) -> bool {
		match self.split_key(key) {
			Some(id) => self.inner.should_stop(id),
			None => false,
		}
	}

	fn requires_value(&self) -> bool {
		self.inner.requires_value()
	}
}

/// Dispatches a mode bitmask plus a descriptor byte-range to a concrete
/// key/value filter (spec §4.5). `LIB_FILTER`/`LUA_FILTER` are recognized
/// bits but require a registered dynamic filter or scripting runtime
/// neither of which this core ships, so both return `NotSupported` unless
/// `lib_lookup`/`lua_lookup` resolve them — mirroring spec §9's "default
/// = NotSupported" registration discipline.
pub fn build_filter<'a>(
	mode: Mode,
	descriptor: &'a [u8],
) -> Result<Box<dyn KeyValueFilter + 'a>> {
	if descriptor.is_empty() {
		return Ok(Box::new(MatchAllFilter));
	}
	if mode.lua_filter() {
		return Err(Status::NotSupported);
	}
	if mode.lib_filter() {
		return Err(Status::NotSupported);
	}
	if mode.suffix() {
		Ok(Box::new(SuffixFilter::new(descriptor.to_vec(), mode.no_prefix())))
	} else {
		Ok(Box::new(PrefixFilter::new(descriptor.to_vec(), mode.no_prefix())))
	}
}
