//! End-to-end workflow scenarios over the in-process deployment: fabric,
//! marshaller, all stage workers, SQLite stores, filesystem object store and
//! disk-emulated tape.

mod common;

use common::{Harness, HarnessOptions, TENANCY};
use nearline_catalog::{CatalogStore, FileQuery};
use nearline_core::details::object_key;
use nearline_core::{ApiAction, Details, Message, PathDetails, RoutingKey, State, StorageType};
use nearline_monitor::MonitorStore;
use nearline_storage::{ObjectStore, TapeStore};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(15);

async fn seed_files(dir: &std::path::Path, files: &[(&str, &[u8])]) -> Vec<std::path::PathBuf> {
    tokio::fs::create_dir_all(dir).await.unwrap();
    let mut out = Vec::new();
    for (name, body) in files {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        out.push(path);
    }
    out
}

/// S1: a two-file put creates the holding, transaction, file rows and
/// object-store locations, and the monitor rolls up to complete.
#[tokio::test]
async fn put_creates_holding_files_and_locations() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", &[65u8; 10240]), ("b.txt", &[66u8; 20480])]).await;

    let txid = harness.put("exp1", &[files[0].as_path(), files[1].as_path()]);
    harness.wait_for_rollup(txid, State::Complete, WAIT).await;

    harness
        .catalog
        .get_holding_by_label("alice", "climate", "exp1")
        .await
        .unwrap()
        .expect("holding exp1 created");
    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    for row in &rows {
        let location = harness
            .catalog
            .get_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap()
            .expect("object store location attached");
        assert!(!location.is_empty_marker());
        assert_eq!(location.root, txid.to_string());
        assert_eq!(location.url_netloc, TENANCY);
        // the object is retrievable at tenancy/<transaction_id>/<sha256(path)>
        assert!(harness
            .objects
            .exists(&location.root, &location.path)
            .await
            .unwrap());
        assert_eq!(location.path, object_key(&row.original_path));
    }
    harness.stop();
}

/// S2: a get straight after a put is served from the object store alone; the
/// archive path stays quiet.
#[tokio::test]
async fn warm_get_round_trips_content_without_tape() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", b"alpha body")]).await;

    let put_txid = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(put_txid, State::Complete, WAIT).await;
    harness.drain_spy().await;

    let target = harness.temp.path().join("restore");
    let original = files[0].to_string_lossy().into_owned();
    let get_txid = harness.get("exp1", &[original.as_str()], &target);
    harness.wait_for_rollup(get_txid, State::Complete, WAIT).await;

    let restored = target.join(original.trim_start_matches('/'));
    assert_eq!(tokio::fs::read(&restored).await.unwrap(), b"alpha body");

    let keys = harness.drain_spy().await;
    assert!(
        !keys.iter().any(|k| k.contains("archive-get")),
        "no archive messages for a warm get: {keys:?}"
    );
    harness.stop();
}

/// S3: the scheduled archive cycle bundles the holding into one aggregate,
/// fills tape locations and records the checksum.
#[tokio::test]
async fn archive_cycle_builds_an_aggregation() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", &[1u8; 4096]), ("b.txt", &[2u8; 8192])]).await;

    let put_txid = harness.put("exp1", &[files[0].as_path(), files[1].as_path()]);
    harness.wait_for_rollup(put_txid, State::Complete, WAIT).await;

    let archive_txid = harness.trigger_archive();
    harness
        .wait_for_rollup(archive_txid, State::Complete, WAIT)
        .await;

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let mut tarnames = Vec::new();
    let mut agg_ids = Vec::new();
    for row in &rows {
        let tape_loc = harness
            .catalog
            .get_location(row.id, StorageType::Tape)
            .await
            .unwrap()
            .expect("tape location filled");
        assert!(!tape_loc.is_empty_marker());
        tarnames.push(tape_loc.path.clone());
        agg_ids.push(tape_loc.aggregation_id.expect("linked to aggregation"));
    }
    // both members share one aggregate
    assert_eq!(tarnames[0], tarnames[1]);
    assert_eq!(agg_ids[0], agg_ids[1]);

    let aggregation = harness
        .catalog
        .get_aggregation(agg_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregation.tarname, tarnames[0]);
    assert_eq!(aggregation.algorithm.as_deref(), Some("ADLER32"));
    assert!(aggregation.checksum.is_some());
    assert!(!aggregation.failed);

    let stat = harness.tape.stat(&aggregation.tarname).await.unwrap();
    assert!(stat.on_tape);
    harness.stop();
}

/// S4: after the warm copies are purged, a get recalls the aggregate through
/// prepare/poll, restores the objects, and delivers the files.
#[tokio::test]
async fn tape_only_get_recalls_through_prepare() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", &[7u8; 3000]), ("b.txt", &[8u8; 5000])]).await;

    let put_txid = harness.put("exp1", &[files[0].as_path(), files[1].as_path()]);
    harness.wait_for_rollup(put_txid, State::Complete, WAIT).await;
    let archive_txid = harness.trigger_archive();
    harness
        .wait_for_rollup(archive_txid, State::Complete, WAIT)
        .await;

    // purge the object-store cache: objects and their catalog locations
    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    for row in &rows {
        let location = harness
            .catalog
            .get_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap()
            .unwrap();
        harness
            .objects
            .delete(&location.root, &location.path)
            .await
            .unwrap();
        harness
            .catalog
            .delete_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap();
    }
    harness.drain_spy().await;

    let target = harness.temp.path().join("restore");
    let originals: Vec<String> = files
        .iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect();
    let get_txid = harness.get(
        "exp1",
        &[originals[0].as_str(), originals[1].as_str()],
        &target,
    );
    harness.wait_for_rollup(get_txid, State::Complete, WAIT).await;

    for (file, original) in files.iter().zip(&originals) {
        let restored = target.join(original.trim_start_matches('/'));
        assert_eq!(
            tokio::fs::read(&restored).await.unwrap(),
            tokio::fs::read(file).await.unwrap()
        );
    }
    // catalog-update refilled the object-store locations
    for row in &rows {
        let location = harness
            .catalog
            .get_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap()
            .expect("location recreated by recall");
        assert!(!location.is_empty_marker());
    }

    let keys = harness.drain_spy().await;
    let prepares = keys
        .iter()
        .filter(|k| k.ends_with("archive-get.prepare"))
        .count();
    assert_eq!(prepares, 1, "one shared aggregate, one prepare: {keys:?}");
    assert!(
        keys.iter().any(|k| k.ends_with("archive-get.prepare-check")),
        "recall polls through prepare-check"
    );
    harness.stop();
}

/// Invariant 2: a second get while the recall is pending cannot schedule
/// another prepare; the empty marker blocks it.
#[tokio::test]
async fn concurrent_recalls_issue_one_prepare_per_aggregation() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", &[9u8; 2000])]).await;

    let put_txid = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(put_txid, State::Complete, WAIT).await;
    let archive_txid = harness.trigger_archive();
    harness
        .wait_for_rollup(archive_txid, State::Complete, WAIT)
        .await;

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    for row in &rows {
        let location = harness
            .catalog
            .get_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap()
            .unwrap();
        harness
            .objects
            .delete(&location.root, &location.path)
            .await
            .unwrap();
        harness
            .catalog
            .delete_location(row.id, StorageType::ObjectStore)
            .await
            .unwrap();
    }
    harness.drain_spy().await;

    let original = files[0].to_string_lossy().into_owned();
    let first = harness.get("exp1", &[original.as_str()], &harness.temp.path().join("r1"));
    let second = harness.get("exp1", &[original.as_str()], &harness.temp.path().join("r2"));

    harness.wait_for_rollup(first, State::Complete, WAIT).await;
    // the loser sees "recall already in progress" and fails
    harness.wait_for_rollup(second, State::Failed, WAIT).await;

    let keys = harness.drain_spy().await;
    let prepares = keys
        .iter()
        .filter(|k| k.ends_with("archive-get.prepare"))
        .count();
    assert_eq!(prepares, 1, "exactly one prepare issued: {keys:?}");
    harness.stop();
}

/// S5: an oversized file fails at indexing with "file too large"; nothing
/// reaches the catalog.
#[tokio::test]
async fn oversized_file_fails_at_indexing() {
    let harness = Harness::start_with(HarnessOptions {
        max_filesize: 1024,
        ..HarnessOptions::default()
    })
    .await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("c.txt", &[0u8; 4096])]).await;

    let txid = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(txid, State::Failed, WAIT).await;

    let trec = harness
        .monitor
        .get_transaction_record(&txid.to_string())
        .await
        .unwrap()
        .unwrap();
    let subs = harness.monitor.sub_records_of(trec.id).await.unwrap();
    let mut reasons = Vec::new();
    for sub in &subs {
        for failed in harness.monitor.get_failed_files(sub.id).await.unwrap() {
            reasons.push(failed.reason);
        }
    }
    assert!(
        reasons.iter().any(|r| r.starts_with("file too large")),
        "reason recorded: {reasons:?}"
    );

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    assert!(rows.is_empty(), "no catalog rows for a failed index");
    harness.stop();
}

/// S6: a transient object-store failure retries with back-off and succeeds;
/// the monitor records the retry.
#[tokio::test]
async fn transient_store_failure_retries_and_completes() {
    let harness = Harness::start_with(HarnessOptions {
        upload_failures: 1,
        ..HarnessOptions::default()
    })
    .await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("d.txt", b"retry body")]).await;

    let txid = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(txid, State::Complete, WAIT).await;

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let location = harness
        .catalog
        .get_location(rows[0].id, StorageType::ObjectStore)
        .await
        .unwrap()
        .unwrap();
    assert!(harness
        .objects
        .exists(&location.root, &location.path)
        .await
        .unwrap());

    let trec = harness
        .monitor
        .get_transaction_record(&txid.to_string())
        .await
        .unwrap()
        .unwrap();
    let subs = harness.monitor.sub_records_of(trec.id).await.unwrap();
    assert!(
        subs.iter().any(|s| s.retry_count >= 1),
        "retry count recorded on the sub record"
    );
    harness.stop();
}

/// Boundary: filelists of length 0, L and L+1 produce 0, 1 and 2
/// sub-transactions.
#[tokio::test]
async fn split_boundaries_produce_expected_sub_transactions() {
    let harness = Harness::start_with(HarnessOptions {
        filelist_max_length: 2,
        ..HarnessOptions::default()
    })
    .await;
    let data = harness.temp.path().join("data");
    let files = seed_files(
        &data,
        &[("a", b"1"), ("b", b"2"), ("c", b"3")],
    )
    .await;

    // length 0: immediate terminal complete
    let empty_txid = harness.put("empty", &[]);
    harness.wait_for_rollup(empty_txid, State::Complete, WAIT).await;

    // length L = 2: exactly one sub-transaction
    let exact = harness.put("exact", &[files[0].as_path(), files[1].as_path()]);
    harness.wait_for_rollup(exact, State::Complete, WAIT).await;
    let trec = harness
        .monitor
        .get_transaction_record(&exact.to_string())
        .await
        .unwrap()
        .unwrap();
    // the parent routing record plus one split child
    let subs = harness.monitor.sub_records_of(trec.id).await.unwrap();
    assert_eq!(subs.len(), 2, "L paths make one split sub: {subs:?}");

    // length L+1 = 3: two sub-transactions
    let over = harness.put("over", &[files[0].as_path(), files[1].as_path(), files[2].as_path()]);
    harness.wait_for_rollup(over, State::Complete, WAIT).await;
    let trec = harness
        .monitor
        .get_transaction_record(&over.to_string())
        .await
        .unwrap()
        .unwrap();
    let subs = harness.monitor.sub_records_of(trec.id).await.unwrap();
    assert_eq!(subs.len(), 3, "L+1 paths make two split subs: {subs:?}");
    harness.stop();
}

/// Invariant 6: replaying an already-applied stage message is a no-op — no
/// duplicate locations and no monitor regression.
#[tokio::test]
async fn replayed_transfer_completion_is_idempotent() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", b"replay body")]).await;

    let txid = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(txid, State::Complete, WAIT).await;

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    // replay the transfer completion with the same payload
    let mut details = Details::new("alice", "climate", ApiAction::Putlist);
    details.transaction_id = txid;
    details.tenancy = Some(TENANCY.to_string());
    let mut pd = PathDetails::from_path(files[0].to_string_lossy());
    pd.set_object_store(TENANCY, true, txid).unwrap();
    let replay = Message::with_filelist(details, vec![pd]);
    harness
        .publisher()
        .publish(
            &RoutingKey::new("nearline-api", "transfer-put", "complete").unwrap(),
            &replay,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let locations = harness.catalog.get_file_locations(rows[0].id).await.unwrap();
    assert_eq!(locations.len(), 1, "no duplicate locations after replay");
    assert_eq!(harness.rollup(txid).await, Some(State::Complete));
    harness.stop();
}

/// Duplicate paths in the same holding fail at catalog-put while the rest of
/// the batch proceeds.
#[tokio::test]
async fn duplicate_path_in_holding_is_rejected() {
    let harness = Harness::start().await;
    let data = harness.temp.path().join("data");
    let files = seed_files(&data, &[("a.txt", b"first"), ("b.txt", b"second")]).await;

    let first = harness.put("exp1", &[files[0].as_path()]);
    harness.wait_for_rollup(first, State::Complete, WAIT).await;

    // second put into the same holding repeats a.txt and adds b.txt
    let second = harness.put("exp1", &[files[0].as_path(), files[1].as_path()]);
    harness.wait_for_rollup(second, State::Failed, WAIT).await;

    let rows = harness
        .catalog
        .get_files("alice", "climate", &FileQuery::default())
        .await
        .unwrap();
    // a.txt once, b.txt once
    assert_eq!(rows.len(), 2);

    let trec = harness
        .monitor
        .get_transaction_record(&second.to_string())
        .await
        .unwrap()
        .unwrap();
    let subs = harness.monitor.sub_records_of(trec.id).await.unwrap();
    let mut reasons = Vec::new();
    for sub in &subs {
        for failed in harness.monitor.get_failed_files(sub.id).await.unwrap() {
            reasons.push(failed.reason);
        }
    }
    assert!(reasons.iter().any(|r| r.contains("already exists")));
    harness.stop();
}
