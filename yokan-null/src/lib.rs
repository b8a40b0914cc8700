//! No-op fixture engine (spec §4.6 "null"): every key/value operation
//! succeeds without storing anything, so a provider or client code path
//! can be exercised end-to-end without allocating real storage. Modeled
//! on the same "does nothing, reports success" shape as `kvdb`'s own
//! `NullIO`/`io::none`-style fixtures used in its test harnesses rather
//! than on a backend with real state.

use yokan_core::backend::{Backend, FetchCallback, FileList, IterCallback};
use yokan_core::filter::KeyValueFilter;
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, NO_MORE_KEYS};
use yokan_core::{BackendConfig, OpenBackend};

#[derive(Default)]
pub struct NullEngine {
	config: BackendConfig,
}

impl OpenBackend for NullEngine {
	fn create(config: &BackendConfig) -> Result<Self> {
		Ok(NullEngine { config: config.clone() })
	}
}

impl Backend for NullEngine {
	fn engine_type(&self) -> &'static str {
		"null"
	}

	fn config(&self) -> serde_json::Value {
		serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
	}

	fn supported_modes(&self) -> u32 {
		u32::MAX
	}

	fn is_sorted(&self) -> bool {
		true
	}

	fn destroy(&self) -> Result<()> {
		Ok(())
	}

	fn count(&self) -> Result<u64> {
		Ok(0)
	}

	fn exists(&self, keys: &PackedKeys, out: &mut BitFieldMut, _mode: Mode) -> Result<()> {
		for i in 0..keys.len() {
			out.set(i, false);
		}
		Ok(())
	}

	fn length(&self, keys: &PackedKeys, sizes_out: &mut [u64], _mode: Mode) -> Result<()> {
		for size in sizes_out.iter_mut().take(keys.len()) {
			*size = yokan_core::status::KEY_NOT_FOUND;
		}
		Ok(())
	}

	fn put(&self, _keys: &PackedKeys, _vals: &PackedKeys, _mode: Mode) -> Result<()> {
		Ok(())
	}

	fn get(&self, keys: &PackedKeys, writer: &mut PackedWriter, _mode: Mode) -> Result<()> {
		for _ in 0..keys.len() {
			writer.write_missing();
		}
		Ok(())
	}

	fn fetch(&self, keys: &PackedKeys, _mode: Mode, callback: &mut FetchCallback<'_>) -> Result<()> {
		for key in keys.iter() {
			callback(key, None);
		}
		Ok(())
	}

	fn erase(&self, _keys: &PackedKeys, _mode: Mode) -> Result<()> {
		Ok(())
	}

	fn list_keys(&self, _from_key: &[u8], _filter: &dyn KeyValueFilter, _mode: Mode, writer: &mut PackedWriter) -> Result<()> {
		writer.fill_remaining(NO_MORE_KEYS);
		Ok(())
	}

	fn list_key_values(
		&self,
		_from_key: &[u8],
		_filter: &dyn KeyValueFilter,
		_mode: Mode,
		keys_out: &mut PackedWriter,
		vals_out: &mut PackedWriter,
	) -> Result<()> {
		keys_out.fill_remaining(NO_MORE_KEYS);
		vals_out.fill_remaining(NO_MORE_KEYS);
		Ok(())
	}

	fn iter(&self, _max: usize, _from_key: &[u8], _filter: &dyn KeyValueFilter, _mode: Mode, _callback: &mut IterCallback<'_>) -> Result<()> {
		Ok(())
	}

	fn start_migration(&self, root: &std::path::Path) -> Result<FileList> {
		Ok(FileList { root: root.to_path_buf(), files: Vec::new() })
	}

	fn mark_migrated(&self) {}

	fn cancel_migration(&self) {}
}

/// Registers this engine's constructor under the name `"null"` (spec §9).
pub fn init() {
	yokan_core::registry::register_backend("null", |config| {
		NullEngine::create(config).map(|db| Box::new(db) as Box<dyn Backend>)
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_key_is_missing() {
		let db = NullEngine::create(&BackendConfig::default()).unwrap();
		let keys = PackedKeys::new(b"abc", &[3]).unwrap();
		let mut out = [0u8; 8];
		let mut sizes_out = [0u64; 1];
		let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
		db.get(&keys, &mut writer, Mode::NONE).unwrap();
		assert_eq!(sizes_out, [yokan_core::status::KEY_NOT_FOUND]);
	}
}
