//! Shared property tests for Yokan backend engines (spec §8), to be
//! executed against actual implementations.
//!
//! Mirrors `kvdb-shared-tests`: free `test_*`
//! functions taking `&dyn Backend` so each engine's own `#[cfg(test)]`
//! module can call the ones relevant to the operations it supports,
//! rather than re-deriving the same assertions per engine.

use yokan_core::backend::{Backend, ControlFlow};
use yokan_core::filter::{MatchAllFilter, PrefixFilter};
use yokan_core::mode::Mode;
use yokan_core::slice::{BitFieldMut, PackedKeys, PackedWriter};
use yokan_core::status::{Result, Status, KEY_NOT_FOUND, NO_MORE_KEYS};

/// Packs a list of byte slices into the `(buffer, sizes)` pair every
/// packed-buffer call expects.
pub fn packed(items: &[&[u8]]) -> (Vec<u8>, Vec<u64>) {
	let mut buf = Vec::new();
	let mut sizes = Vec::new();
	for item in items {
		buf.extend_from_slice(item);
		sizes.push(item.len() as u64);
	}
	(buf, sizes)
}

fn single(item: &[u8]) -> (Vec<u8>, Vec<u64>) {
	(item.to_vec(), vec![item.len() as u64])
}

/// A key round-trips through `put`/`get` with its exact bytes.
pub fn test_put_and_get(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-key");
	let (vbuf, vsizes) = single(b"shared-tests-value");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut out = vec![0u8; vbuf.len()];
	let mut sizes_out = [0u64; 1];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::NONE)?;
	assert_eq!(sizes_out[0], vbuf.len() as u64);
	assert_eq!(&out[..vbuf.len()], vbuf.as_slice());
	Ok(())
}

/// `erase` is idempotent: erasing an already-absent key is not an error.
pub fn test_erase_is_idempotent(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-missing");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	db.erase(&keys, Mode::NONE)?;
	db.erase(&keys, Mode::NONE)?;
	Ok(())
}

/// A key that was never inserted reports `KEY_NOT_FOUND`, not an error.
pub fn test_missing_key_is_reported_not_erred(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-absent");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;

	let mut out = [0u8; 8];
	let mut sizes_out = [0u64; 1];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::NONE)?;
	assert_eq!(sizes_out[0], KEY_NOT_FOUND);

	let mut bits = [0u8; 1];
	let mut flags = BitFieldMut::new(&mut bits);
	db.exists(&keys, &mut flags, Mode::NONE)?;
	assert!(!flags.get(0));
	Ok(())
}

/// `get` copying into a too-small buffer marks the slot `SIZE_TOO_SMALL`
/// and leaves the rest of the batch intact (spec §4.3 "too small" rule).
pub fn test_get_reports_size_too_small(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-bigval");
	let (vbuf, vsizes) = single(b"0123456789");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut out = [0u8; 2];
	let mut sizes_out = [0u64; 1];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::NONE)?;
	assert_eq!(sizes_out[0], yokan_core::status::SIZE_TOO_SMALL);
	Ok(())
}

/// A sorted engine's `listKeys` honors `INCLUSIVE`: the starting key is
/// only part of the output when the bit is set.
pub fn test_ordered_scan_respects_inclusive(db: &dyn Backend) -> Result<()> {
	assert!(db.is_sorted(), "caller must only run this against a sorted engine");

	let (kbuf, ksizes) = packed(&[b"a", b"b", b"c"]);
	let (vbuf, vsizes) = packed(&[b"1", b"2", b"3"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut out = [0u8; 8];
	let mut sizes_out = [0u64; 8];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.list_keys(b"b", &MatchAllFilter, Mode::new(yokan_core::mode::INCLUSIVE), &mut writer)?;
	let inclusive_count = sizes_out.iter().take_while(|&&s| s != NO_MORE_KEYS).count();

	let mut out2 = [0u8; 8];
	let mut sizes_out2 = [0u64; 8];
	let mut writer2 = PackedWriter::new(&mut out2, &mut sizes_out2);
	db.list_keys(b"b", &MatchAllFilter, Mode::NONE, &mut writer2)?;
	let exclusive_count = sizes_out2.iter().take_while(|&&s| s != NO_MORE_KEYS).count();

	assert_eq!(inclusive_count, exclusive_count + 1);
	Ok(())
}

/// Under `NO_PREFIX`, a prefix-filtered scan strips the matched prefix
/// from every returned key (spec §4.5, §8 property 6).
pub fn test_prefix_filter_strips_under_no_prefix(db: &dyn Backend) -> Result<()> {
	assert!(db.is_sorted(), "caller must only run this against a sorted engine");

	let (kbuf, ksizes) = packed(&[b"user:1", b"user:2", b"zzz"]);
	let (vbuf, vsizes) = packed(&[b"a", b"b", b"c"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let filter = PrefixFilter::new(b"user:".to_vec(), true);
	let mut out = [0u8; 16];
	let mut sizes_out = [0u64; 4];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.list_keys(b"", &filter, Mode::new(yokan_core::mode::NO_PREFIX), &mut writer)?;

	assert_eq!(sizes_out[0], 1);
	assert_eq!(&out[0..1], b"1");
	assert_eq!(sizes_out[1], 1);
	assert_eq!(&out[1..2], b"2");
	assert_eq!(sizes_out[2], NO_MORE_KEYS);
	Ok(())
}

/// `KEEP_LAST` blanks every matched key like `IGNORE_KEYS` except the last
/// one, whose real bytes survive (spec §4.2 "implies `IGNORE_KEYS` but the
/// last-returned key is kept intact").
pub fn test_keep_last_preserves_final_key(db: &dyn Backend) -> Result<()> {
	assert!(db.is_sorted(), "caller must only run this against a sorted engine");

	let (kbuf, ksizes) = packed(&[b"keep-last-a", b"keep-last-b", b"keep-last-c"]);
	let (vbuf, vsizes) = packed(&[b"1", b"2", b"3"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let filter = PrefixFilter::new(b"keep-last-".to_vec(), false);
	let mut keys_buf = [0u8; 32];
	let mut key_sizes = [0u64; 3];
	let mut keys_writer = PackedWriter::new(&mut keys_buf, &mut key_sizes);
	let mut vals_buf = [0u8; 3];
	let mut val_sizes = [0u64; 3];
	let mut vals_writer = PackedWriter::new(&mut vals_buf, &mut val_sizes);
	db.list_key_values(b"", &filter, Mode::new(yokan_core::mode::KEEP_LAST), &mut keys_writer, &mut vals_writer)?;

	assert_eq!(key_sizes[0], 0);
	assert_eq!(key_sizes[1], 0);
	assert_eq!(key_sizes[2], b"keep-last-c".len() as u64);
	assert_eq!(&keys_buf[0..key_sizes[2] as usize], b"keep-last-c");
	assert_eq!(val_sizes, [1, 1, 1]);
	Ok(())
}

/// `CONSUME` erases every matched key once `get` has copied its value.
pub fn test_consume_erases_matched_keys(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-consume");
	let (vbuf, vsizes) = single(b"gone-after-read");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut out = vec![0u8; vbuf.len()];
	let mut sizes_out = [0u64; 1];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::new(yokan_core::mode::CONSUME))?;
	assert_eq!(sizes_out[0], vbuf.len() as u64);

	let mut bits = [0u8; 1];
	let mut flags = BitFieldMut::new(&mut bits);
	db.exists(&keys, &mut flags, Mode::NONE)?;
	assert!(!flags.get(0));
	Ok(())
}

/// `iter` stops as soon as the callback returns `Stop`.
pub fn test_iter_stops_on_callback_request(db: &dyn Backend) -> Result<()> {
	assert!(db.is_sorted(), "caller must only run this against a sorted engine");

	let (kbuf, ksizes) = packed(&[b"m1", b"m2", b"m3"]);
	let (vbuf, vsizes) = packed(&[b"1", b"2", b"3"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut seen = 0usize;
	db.iter(usize::MAX, b"", &MatchAllFilter, Mode::NONE, &mut |_k, _v| {
		seen += 1;
		if seen == 1 {
			ControlFlow::Stop
		} else {
			ControlFlow::Continue
		}
	})?;
	assert_eq!(seen, 1);
	Ok(())
}

/// Once a migration commits, every subsequent call but `destroy` reports
/// `Migrated` (spec §4.9). For key/value engines: probes via `exists`.
pub fn test_migration_marks_engine_migrated(db: &dyn Backend, root: &std::path::Path) -> Result<()> {
	match db.start_migration(root) {
		Ok(_) => {}
		Err(Status::NotSupported) => return Ok(()),
		Err(e) => return Err(e),
	}
	db.mark_migrated();

	let (kbuf, ksizes) = single(b"shared-tests-after-migration");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let mut bits = [0u8; 1];
	let mut flags = BitFieldMut::new(&mut bits);
	assert_eq!(db.exists(&keys, &mut flags, Mode::NONE), Err(Status::Migrated));
	Ok(())
}

/// The document-store analogue of [`test_migration_marks_engine_migrated`],
/// probing via `coll_create` instead of `exists` for engines with a native
/// document representation that never implement the key/value methods.
pub fn test_doc_migration_marks_engine_migrated(db: &dyn Backend, root: &std::path::Path) -> Result<()> {
	match db.start_migration(root) {
		Ok(_) => {}
		Err(Status::NotSupported) => return Ok(()),
		Err(e) => return Err(e),
	}
	db.mark_migrated();
	assert_eq!(db.coll_create(b"shared-tests-after-migration"), Err(Status::Migrated));
	Ok(())
}

/// Documents round-trip through `collCreate`/`docStore`/`docLoad`, and
/// `collSize`/`collLastID` track storage and erasure correctly.
pub fn test_document_store_roundtrip(db: &dyn Backend) -> Result<()> {
	db.coll_create(b"shared-tests-coll")?;
	let (dbuf, dsizes) = packed(&[b"doc-a", b"doc-b"]);
	let docs = PackedKeys::new(&dbuf, &dsizes)?;
	let mut ids = [0u64; 2];
	db.doc_store(b"shared-tests-coll", &docs, &mut ids)?;
	assert_eq!(ids[1], ids[0] + 1);
	assert_eq!(db.coll_last_id(b"shared-tests-coll")?, ids[1] + 1);
	assert_eq!(db.coll_size(b"shared-tests-coll")?, 2);

	let mut out = [0u8; 16];
	let mut sizes_out = [0u64; 2];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.doc_load(b"shared-tests-coll", &ids, &mut writer, Mode::NONE)?;
	assert_eq!(sizes_out, [5, 5]);

	db.doc_erase(b"shared-tests-coll", &ids)?;
	assert_eq!(db.coll_size(b"shared-tests-coll")?, 0);
	Ok(())
}

/// Non-packed `get` places each copied value at a fixed per-slot stride
/// taken from the caller's declared capacities rather than back-to-back
/// (spec §4.3 `get(..., packed=false)`, scenario S1).
pub fn test_unpacked_get_uses_fixed_stride(db: &dyn Backend) -> Result<()> {
	for (k, v) in [(b"alpha".as_slice(), b"1".as_slice()), (b"beta", b"22"), (b"gamma", b"333")] {
		let (kbuf, ksizes) = single(k);
		let (vbuf, vsizes) = single(v);
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		let vals = PackedKeys::new(&vbuf, &vsizes)?;
		db.put(&keys, &vals, Mode::NONE)?;
	}

	let (kbuf, ksizes) = packed(&[b"alpha", b"beta", b"gamma", b"delta"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;

	let mut out = [0u8; 32];
	let mut sizes_out = [8u64; 4];
	let mut writer = PackedWriter::new_unpacked(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::NONE)?;

	assert_eq!(sizes_out, [1, 2, 3, KEY_NOT_FOUND]);
	assert_eq!(&out[0..1], b"1");
	assert_eq!(&out[8..10], b"22");
	assert_eq!(&out[16..19], b"333");
	Ok(())
}

/// Packed `get` against a shared buffer too small for the whole batch:
/// slots that fit keep their real size, the one that doesn't gets
/// `SIZE_TOO_SMALL`, and the batch still completes (spec §8 scenario S2).
pub fn test_packed_get_short_buffer(db: &dyn Backend) -> Result<()> {
	for (k, v) in [(b"alpha".as_slice(), b"1".as_slice()), (b"beta", b"22"), (b"gamma", b"333")] {
		let (kbuf, ksizes) = single(k);
		let (vbuf, vsizes) = single(v);
		let keys = PackedKeys::new(&kbuf, &ksizes)?;
		let vals = PackedKeys::new(&vbuf, &vsizes)?;
		db.put(&keys, &vals, Mode::NONE)?;
	}

	let (kbuf, ksizes) = packed(&[b"alpha", b"beta", b"gamma"]);
	let keys = PackedKeys::new(&kbuf, &ksizes)?;

	let mut out = [0u8; 4];
	let mut sizes_out = [0u64; 3];
	let mut writer = PackedWriter::new(&mut out, &mut sizes_out);
	db.get(&keys, &mut writer, Mode::NONE)?;

	assert_eq!(sizes_out, [1, 2, yokan_core::status::SIZE_TOO_SMALL]);
	assert_eq!(&out[0..3], b"122");
	Ok(())
}

/// Packed-get equivalence (spec §8 testable property 3): for the same
/// inputs, packed and unpacked `get` copy the exact same bytes — the only
/// difference is how those bytes are laid out and sized per slot.
pub fn test_packed_and_unpacked_get_agree_on_bytes(db: &dyn Backend) -> Result<()> {
	let (kbuf, ksizes) = single(b"shared-tests-equivalence");
	let (vbuf, vsizes) = single(b"payload");
	let keys = PackedKeys::new(&kbuf, &ksizes)?;
	let vals = PackedKeys::new(&vbuf, &vsizes)?;
	db.put(&keys, &vals, Mode::NONE)?;

	let mut packed_out = [0u8; 16];
	let mut packed_sizes = [0u64; 1];
	let mut packed_writer = PackedWriter::new(&mut packed_out, &mut packed_sizes);
	db.get(&keys, &mut packed_writer, Mode::NONE)?;

	let mut unpacked_out = [0u8; 16];
	let mut unpacked_sizes = [16u64; 1];
	let mut unpacked_writer = PackedWriter::new_unpacked(&mut unpacked_out, &mut unpacked_sizes);
	db.get(&keys, &mut unpacked_writer, Mode::NONE)?;

	assert_eq!(packed_sizes[0], unpacked_sizes[0]);
	assert_eq!(&packed_out[..packed_sizes[0] as usize], &unpacked_out[..unpacked_sizes[0] as usize]);
	Ok(())
}

/// `docLoad` honors the same packed/unpacked distinction as `get` (spec
/// §4.4 "mirror the key/value analogues"): non-packed mode reserves a
/// fixed per-slot capacity for each document instead of packing them
/// back-to-back.
pub fn test_doc_load_unpacked_uses_fixed_stride(db: &dyn Backend) -> Result<()> {
	db.coll_create(b"shared-tests-stride-coll")?;
	let (dbuf, dsizes) = packed(&[b"1", b"22", b"333"]);
	let docs = PackedKeys::new(&dbuf, &dsizes)?;
	let mut ids = [0u64; 3];
	db.doc_store(b"shared-tests-stride-coll", &docs, &mut ids)?;

	let mut out = [0u8; 32];
	let mut sizes_out = [8u64; 3];
	let mut writer = PackedWriter::new_unpacked(&mut out, &mut sizes_out);
	db.doc_load(b"shared-tests-stride-coll", &ids, &mut writer, Mode::NONE)?;

	assert_eq!(sizes_out, [1, 2, 3]);
	assert_eq!(&out[0..1], b"1");
	assert_eq!(&out[8..10], b"22");
	assert_eq!(&out[16..19], b"333");
	Ok(())
}

/// `collDrop` removes the collection and every document beneath it.
pub fn test_collection_drop_removes_documents(db: &dyn Backend) -> Result<()> {
	db.coll_create(b"shared-tests-droppable")?;
	let (dbuf, dsizes) = packed(&[b"x"]);
	let docs = PackedKeys::new(&dbuf, &dsizes)?;
	let mut ids = [0u64; 1];
	db.doc_store(b"shared-tests-droppable", &docs, &mut ids)?;

	db.coll_drop(b"shared-tests-droppable")?;
	assert!(!db.coll_exists(b"shared-tests-droppable")?);
	assert_eq!(db.coll_create(b"shared-tests-droppable"), Ok(()));
	Ok(())
}
