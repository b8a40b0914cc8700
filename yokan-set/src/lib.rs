//! Key-only set engines (spec §4.6 "ordered-set" / "unordered-set").
//!
//! A set stores presence, not payload: every value must be empty, and
//! `put` rejects anything else with `InvalidArg`. Rather than duplicate
//! the map engines' storage and `WAIT`/`NOTIFY` machinery, a set is a
//! thin wrapper that delegates to an inner [`yokan_core::Backend`] and
//! enforces the empty-value invariant at the boundary — the composition
//! style the core crate already uses for [`yokan_core::DocumentStore`].

use yokan_core::backend::{Backend, ControlFlow, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status};
use yokan_core::{BackendConfig, OpenBackend};

/// Wraps any key/value engine and rejects non-empty values on `put`.
pub struct SetEngine<E: Backend> {
	inner: E,
}

impl<E: Backend> SetEngine<E> {
	pub fn new(inner: E) -> Self {
		SetEngine { inner }
	}

	fn check_values_empty(vals: &PackedKeys) -> Result<()> {
		for val in vals.iter() {
			if !val.is_empty() {
				return Err(Status::InvalidArg);
			}
		}
		Ok(())
	}
}

impl<E: Backend> Backend for SetEngine<E> {
	fn engine_type(&self) -> &'static str {
		self.inner.engine_type()
	}

	fn config(&self) -> serde_json::Value {
		self.inner.config()
	}

	fn supported_modes(&self) -> u32 {
		self.inner.supported_modes()
	}

	fn is_sorted(&self) -> bool {
		self.inner.is_sorted()
	}

	fn destroy(&self) -> Result<()> {
		self.inner.destroy()
	}

	fn count(&self) -> Result<u64> {
		self.inner.count()
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, mode: Mode) -> Result<()> {
		self.inner.exists(keys, out, mode)
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], mode: Mode) -> Result<()> {
		self.inner.length(keys, sizes_out, mode)
	}

	fn put(&self, keys: &PackedKeys, vals: &PackedKeys, mode: Mode) -> Result<()> {
		Self::check_values_empty(vals)?;
		self.inner.put(keys, vals, mode)
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, mode: Mode) -> Result<()> {
		self.inner.get(keys, writer, mode)
	}

	fn fetch(&self, keys: &PackedKeys, mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		self.inner.fetch(keys, mode, callback)
	}

	fn erase(&self, keys: &PackedKeys, mode: Mode) -> Result<()> {
		self.inner.erase(keys, mode)
	}

	fn list_keys(&self, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		self.inner.list_keys(from_key, filter, mode, writer)
	}

	fn list_key_values(
		&self,
		from_key: &[u8],
		filter: &dyn KeyValueFilter,
		mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		self.inner.list_key_values(from_key, filter, mode, keys_out, vals_out)
	}

	fn iter(&self, max: usize, from_key: &[u8], filter: &dyn KeyValueFilter, mode: Mode, callback: &mut IterCallback<'_>) -> Result<()> {
		self.inner.iter(max, from_key, filter, mode, callback)
	}

	fn start_migration(&self, root: &std::path::Path) -> Result<FileList> {
		self.inner.start_migration(root)
	}

	fn mark_migrated(&self) {
		self.inner.mark_migrated()
	}

	fn cancel_migration(&self) {
		self.inner.cancel_migration()
	}
}

/// Registers `"ordered-set"` over [`yokan_ordered_map::OrderedMap`] and
/// `"unordered-set"` over [`yokan_unordered_map::UnorderedMap`] (spec §9).
pub fn init() {
	yokan_core::registry::register_backend("ordered-set", |config| {
		yokan_ordered_map::OrderedMap::create(config)
			.map(|db| Box::new(SetEngine::new(db)) as Box<dyn Backend>)
	});
	yokan_core::registry::register_backend("unordered-set", |config| {
		yokan_unordered_map::UnorderedMap::create(config)
			.map(|db| Box::new(SetEngine::new(db)) as Box<dyn Backend>)
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use yokan_ordered_map::OrderedMap;

	fn packed(items: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
		let mut buf = Vec::new();
		let mut sizes = Vec::new();
		for item in items {
			buf.extend_from_slice(item);
			sizes.push(item.len() as u64);
		}
		(buf, sizes)
	}

	#[test]
	fn rejects_non_empty_value() {
		let set = SetEngine::new(OrderedMap::create(&BackendConfig::default()).unwrap());
		let (kbuf, ksizes) = packed(&[b"member"]);
		let (vbuf, vsizes) = packed(&[b"payload"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&vbuf, &vsizes).unwrap();
		assert_eq!(set.put(&keys, &vals, Mode::NONE).unwrap_err(), Status::InvalidArg);
	}

	#[test]
	fn accepts_empty_value_as_membership() {
		let set = SetEngine::new(OrderedMap::create(&BackendConfig::default()).unwrap());
		let (kbuf, ksizes) = packed(&[b"member"]);
		let keys = PackedKeys::new(&kbuf, &ksizes).unwrap();
		let vals = PackedKeys::new(&[], &[0]).unwrap();
		set.put(&keys, &vals, Mode::NONE).unwrap();
		assert_eq!(set.count().unwrap(), 1);
	}
}
