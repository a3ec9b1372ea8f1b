use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

use romsmith_core::depot::{
    ingest, Depot, DepotIndex, DepotRecord, DepotStore, IngestOptions, NeededMatch,
};
use romsmith_core::hasher::{hash_data, HashSelection, Hashes};
use romsmith_core::{CancelToken, Error, SilentReporter};

fn record(data: &[u8]) -> DepotRecord {
    DepotRecord::from_hashes(&hash_data(data, HashSelection::DEPOT), "/depot").unwrap()
}

fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Layout:
///   input/
///     a.rom          ("rom a")
///     b.rom          ("rom b")
///     copy_of_a.rom  ("rom a")
///     pack.zip       (c.rom = "rom c", a.rom = "rom a")
fn create_input_tree(root: &Path) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("a.rom"), b"rom a").unwrap();
    fs::write(root.join("b.rom"), b"rom b").unwrap();
    fs::write(root.join("copy_of_a.rom"), b"rom a").unwrap();
    write_zip(&root.join("pack.zip"), &[("c.rom", b"rom c"), ("a.rom", b"rom a")]);
}

fn options(only_needed: bool) -> IngestOptions {
    IngestOptions {
        only_needed,
        workers: 2,
        sub_workers: 2,
        ..Default::default()
    }
}

#[test]
fn test_ingest_stores_each_content_once() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    create_input_tree(&input);
    let depot = Depot::open(&tmp.path().join("depot"), None).unwrap();

    let summary = ingest(
        &depot,
        &[input],
        &options(false),
        &SilentReporter,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(summary.inputs, 4);
    assert_eq!(summary.files, 5);
    assert_eq!(summary.stored, 3);
    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.failed, 0);

    let stats = depot.index().stats().unwrap();
    assert_eq!(stats.sha1, 3);
    assert_eq!(stats.crc, 3);
    assert_eq!(stats.md5sha1, 3);

    let sha1 = hash_data(b"rom c", HashSelection::DEPOT).sha1.unwrap();
    assert!(depot.store().contains(&sha1));
    assert_eq!(
        depot.index().depot_of(&sha1).unwrap().as_deref(),
        Some(depot.label())
    );
}

#[test]
fn test_only_needed_ingest_is_idempotent() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    create_input_tree(&input);
    let depot = Depot::open(&tmp.path().join("depot"), None).unwrap();
    let cancel = CancelToken::new();

    let first = ingest(&depot, &[input.clone()], &options(true), &SilentReporter, &cancel).unwrap();
    let stats_after_first = depot.index().stats().unwrap();

    let second = ingest(&depot, &[input], &options(true), &SilentReporter, &cancel).unwrap();
    assert!(first.stored > 0);
    assert_eq!(second.stored, 0);
    assert_eq!(second.indexed, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(depot.index().stats().unwrap(), stats_after_first);
}

#[test]
fn test_needed_match_modes() {
    let index = DepotIndex::open_in_memory().unwrap();
    index.ingest_batch(&[record(b"rom a")], None).unwrap();

    let known = hash_data(b"rom a", HashSelection::DEPOT);
    assert!(index.contains(&known, NeededMatch::AnyHash).unwrap());
    assert!(index.contains(&known, NeededMatch::AllHashes).unwrap());

    // Same CRC32, different content otherwise
    let collided = Hashes {
        sha1: hash_data(b"other", HashSelection::DEPOT).sha1,
        md5: hash_data(b"other", HashSelection::DEPOT).md5,
        ..known.clone()
    };
    assert!(index.contains(&collided, NeededMatch::AnyHash).unwrap());
    assert!(!index.contains(&collided, NeededMatch::AllHashes).unwrap());

    let crc_only = Hashes {
        size: known.size,
        crc32: known.crc32.clone(),
        ..Default::default()
    };
    assert!(index.contains(&crc_only, NeededMatch::AnyHash).unwrap());
    assert!(!index.contains(&crc_only, NeededMatch::AllHashes).unwrap());

    let unknown = hash_data(b"never stored", HashSelection::DEPOT);
    assert!(!index.contains(&unknown, NeededMatch::AnyHash).unwrap());
}

#[test]
fn test_failed_batch_leaves_no_rows() {
    let index = DepotIndex::open_in_memory().unwrap();
    let mut bad = record(b"rom b");
    bad.sha1 = "not-a-sha1".to_string();

    let result = index.ingest_batch(&[record(b"rom a"), bad], None);
    assert!(matches!(result, Err(Error::IndexTransaction(_))));

    let stats = index.stats().unwrap();
    assert_eq!(stats.crc, 0);
    assert_eq!(stats.sha1, 0);
    assert_eq!(stats.crcsha1, 0);
}

#[test]
fn test_cancelled_batch_is_rolled_back() {
    let index = DepotIndex::open_in_memory().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = index.ingest_batch(&[record(b"rom a")], Some(&cancel));
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(index.stats().unwrap().sha1, 0);
}

#[test]
fn test_rows_are_never_rewritten_and_conflicts_reported() {
    let index = DepotIndex::open_in_memory().unwrap();
    let first = record(b"rom a");
    let outcome = index.ingest_batch(&[first.clone()], None).unwrap();
    assert_eq!(outcome.inserted, 1);

    let mut moved = first.clone();
    moved.depot = "/elsewhere".to_string();
    let outcome = index.ingest_batch(&[moved], None).unwrap();
    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.already_present, 1);
    assert_eq!(index.depot_of(&first.sha1).unwrap().as_deref(), Some("/depot"));

    let mut collision = record(b"rom b");
    collision.crc32 = first.crc32.clone();
    let outcome = index.ingest_batch(&[collision.clone()], None).unwrap();
    assert_eq!(outcome.conflicts, vec![first.crc32.clone()]);

    let by_crc = index.lookup(&first.crc32).unwrap();
    assert_eq!(by_crc.len(), 2);
    assert_eq!(index.lookup(&collision.md5).unwrap()[0].sha1, collision.sha1);
    assert_eq!(index.lookup(&first.sha1.to_uppercase()).unwrap().len(), 1);
    assert!(index.lookup("xyz").is_err());
}

#[test]
fn test_depot_layout_is_deterministic() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input");
    create_input_tree(&input);

    let one = Depot::with_index(&tmp.path().join("one"), DepotIndex::open_in_memory().unwrap());
    let two = Depot::with_index(&tmp.path().join("two"), DepotIndex::open_in_memory().unwrap());
    let cancel = CancelToken::new();
    ingest(&one, &[input.clone()], &options(false), &SilentReporter, &cancel).unwrap();
    ingest(&two, &[input], &options(false), &SilentReporter, &cancel).unwrap();

    let sha1 = hash_data(b"rom b", HashSelection::DEPOT).sha1.unwrap();
    let rel = DepotStore::relative_path(&sha1).unwrap();
    assert_eq!(
        rel.to_string_lossy(),
        format!("{}/{}/{}/{}/{}.gz", &sha1[0..2], &sha1[2..4], &sha1[4..6], &sha1[6..8], sha1)
    );
    assert_eq!(
        fs::read(tmp.path().join("one").join(&rel)).unwrap(),
        fs::read(tmp.path().join("two").join(&rel)).unwrap()
    );
}

#[test]
fn test_index_survives_reopen() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("index/depot.sqlite");
    {
        let index = DepotIndex::open(&db).unwrap();
        index.ingest_batch(&[record(b"rom a")], None).unwrap();
    }
    let index = DepotIndex::open(&db).unwrap();
    assert_eq!(index.stats().unwrap().sha1, 1);
}
