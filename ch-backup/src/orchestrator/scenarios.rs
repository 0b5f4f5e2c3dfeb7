//! End-to-end behaviour of create, restore, delete, purge and sweep against
//! the fake database and in-memory storage.

use super::*;
use crate::dedup::{RecordState, RefOwner, Reserve, StoredObject};
use crate::fs::digest::ContentHash;
use crate::lock::scope_resource;
use crate::retention::RetentionDecision;
use crate::testutil::Harness;
use bytes::Bytes;
use std::time::Duration;

const PART_A: &str = "all_1_1_0";
const PART_B: &str = "all_2_2_0";

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn restore_reproduces_every_byte() {
    let h = Harness::new();
    h.database.add_part(
        "db.events",
        PART_A,
        &[
            ("checksums.txt", b"sums"),
            ("data.bin", &[7u8; 4096]),
            ("columns.txt", b"x UInt64"),
        ],
    );
    h.database
        .add_part("db.users", PART_A, &[("data.bin", b"alice,bob")]);
    let original = h.database.part_files("db.events", PART_A);

    let node = h.node("a");
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert_eq!(report.state, BackupState::Finished);
    assert_eq!((report.tables, report.parts, report.files), (2, 2, 4));
    assert!(h.database.frozen_tags().is_empty());

    h.database.drop_table("db.events");
    h.database.drop_table("db.users");
    let restored = node
        .restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(restored.files, 4);
    assert_eq!(h.database.attached_part("db.events", PART_A), Some(original));
    assert!(h.database.has_table("db.users"));
    assert!(!h.config.backup.restore_dir.join(&report.backup_id).exists());
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let h = Harness::new();
    h.database.add_part("db.a", PART_A, &[("data.bin", b"same bytes")]);
    h.database.add_part("db.b", PART_A, &[("data.bin", b"same bytes")]);
    let node = h.node("a");

    let first = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert_eq!(h.content_keys().len(), 1);
    assert_eq!(h.refcount(b"same bytes").await, Some(2));

    let second = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert_ne!(first.backup_id, second.backup_id);
    assert_eq!(second.uploaded_bytes, 0);
    assert_eq!(second.deduplicated_bytes, second.total_bytes);
    assert_eq!(h.content_keys().len(), 1);
    assert_eq!(h.refcount(b"same bytes").await, Some(4));
}

#[tokio::test]
async fn concurrent_nodes_upload_shared_content_once() {
    let h = Harness::sqlite();
    h.database.add_part(
        "db.t",
        PART_A,
        &[("a.bin", &[1u8; 2000]), ("b.bin", &[2u8; 3000])],
    );
    let mut left = h.config.clone();
    left.backup.scope = "shard-1".into();
    let mut right = h.config.clone();
    right.backup.scope = "shard-2".into();
    let n1 = h.node_with("n1", left);
    let n2 = h.node_with("n2", right);

    let (c1, c2) = (cancel(), cancel());
    let (r1, r2) = tokio::join!(
        n1.create(CreateOptions::default(), &c1),
        n2.create(CreateOptions::default(), &c2)
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    // Two content objects plus two manifests.
    assert_eq!(h.storage.put_count(), 4);
    assert!(r1.uploaded_bytes + r2.uploaded_bytes > 0);
    assert_eq!(r1.deduplicated_bytes + r2.deduplicated_bytes, 5000);
    assert_eq!(h.refcount(&[1u8; 2000]).await, Some(2));
    assert_eq!(h.refcount(&[2u8; 3000]).await, Some(2));
}

#[tokio::test]
async fn deleting_one_backup_keeps_shared_content() {
    let h = Harness::new();
    let (c1, c2, c3): (&[u8], &[u8], &[u8]) = (b"shared", b"only in a", b"only in b");
    h.database.add_part("db.t", PART_A, &[("x.bin", c1), ("y.bin", c2)]);
    let node = h.node("a");
    let a = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    h.database.remove_part("db.t", PART_A);
    h.database.add_part("db.t", PART_B, &[("x.bin", c1), ("z.bin", c3)]);
    let b = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    assert_eq!(h.refcount(c1).await, Some(2));
    assert_eq!(h.refcount(c2).await, Some(1));
    assert_eq!(h.refcount(c3).await, Some(1));

    let deleted = node.delete(&a.backup_id, false, &cancel()).await.unwrap();
    assert_eq!(deleted.released_references, 2);
    assert_eq!(deleted.objects_deleted, 1);

    assert_eq!(h.refcount(c1).await, Some(1));
    assert_eq!(h.refcount(c2).await, None);
    assert_eq!(h.refcount(c3).await, Some(1));
    assert!(!h.content_keys().contains(&ContentHash::of(c2).storage_key()));

    // B is still fully restorable.
    h.database.drop_table("db.t");
    node.restore(&b.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(
        h.database.attached_part("db.t", PART_B).unwrap()["x.bin"],
        c1.to_vec()
    );
    assert!(matches!(
        node.show(&a.backup_id).await.unwrap_err(),
        BackupError::BackupNotFound(_)
    ));
}

#[tokio::test]
async fn second_operation_on_a_scope_is_refused() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("data.bin", b"1")]);
    let held = h
        .coordination
        .locks
        .acquire(&scope_resource("test"), "other-node", Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap();

    let node = h.node("a");
    let err = node.create(CreateOptions::default(), &cancel()).await.unwrap_err();
    assert!(matches!(err, BackupError::LockBusy { ref holder, .. } if holder == "other-node"));
    assert!(h.content_keys().is_empty());

    h.coordination.locks.release(&held).await.unwrap();
    node.create(CreateOptions::default(), &cancel()).await.unwrap();

    // Another scope is independent.
    let mut other = h.config.clone();
    other.backup.scope = "elsewhere".into();
    h.coordination
        .locks
        .acquire(&scope_resource("test"), "other-node", Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap();
    h.node_with("b", other)
        .create(CreateOptions::default(), &cancel())
        .await
        .unwrap();
}

#[tokio::test]
async fn purge_never_goes_below_min_keep() {
    let mut h = Harness::new();
    h.config.retention.min_keep = 2;
    h.config.retention.max_age = Some(Duration::from_millis(1));
    let node = h.node("a");

    let mut ids = Vec::new();
    for i in 0..4u8 {
        h.database.add_part("db.t", &format!("all_{i}_{i}_0"), &[("data.bin", &[i; 64])]);
        ids.push(node.create(CreateOptions::default(), &cancel()).await.unwrap().backup_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let dry = node.purge(true, &cancel()).await.unwrap();
    assert!(dry.deleted.is_empty());
    assert_eq!(dry.decisions.iter().filter(|d| d.decision.is_delete()).count(), 2);
    assert_eq!(node.list().await.unwrap().len(), 4);

    let report = node.purge(false, &cancel()).await.unwrap();
    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut expected = vec![ids[0].clone(), ids[1].clone()];
    expected.sort();
    assert_eq!(deleted, expected);
    let remaining: Vec<String> = node
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.backup_id)
        .collect();
    assert_eq!(remaining, vec![ids[2].clone(), ids[3].clone()]);

    // Survivors share content with the purged backups.
    for id in &remaining {
        h.database.drop_table("db.t");
        node.restore(id, RestoreOptions::default(), &cancel()).await.unwrap();
    }
}

#[tokio::test]
async fn failed_create_leaves_no_manifest_and_no_references() {
    let h = Harness::new();
    h.database.add_part(
        "db.t",
        PART_A,
        &[("a.bin", &[1u8; 100]), ("b.bin", &[2u8; 100]), ("c.bin", &[3u8; 100])],
    );
    h.storage.fail_next_puts(1);
    let node = h.node("a");

    let err = node.create(CreateOptions::default(), &cancel()).await.unwrap_err();
    assert!(matches!(
        err,
        BackupError::TransientStorage(_) | BackupError::StorageUnavailable { .. }
    ));
    assert!(node.list().await.unwrap().is_empty());
    assert!(h
        .coordination
        .dedup
        .referencing_backups()
        .await
        .unwrap()
        .is_empty());
    assert!(h.database.frozen_tags().is_empty());

    // No record may be reserved and referenced at once.
    for data in [[1u8; 100], [2u8; 100], [3u8; 100]] {
        if let Some(record) = h
            .coordination
            .dedup
            .record(&ContentHash::of(&data))
            .await
            .unwrap()
        {
            assert!(!(record.state == RecordState::Reserved && record.refcount > 0));
        }
    }

    // The lock was released and the next attempt succeeds.
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert_eq!(report.files, 3);
}

#[tokio::test]
async fn sweep_reclaims_content_of_crashed_creates() {
    let mut h = Harness::new();
    h.config.retention.orphan_grace = Duration::ZERO;
    let dedup = h.coordination.dedup.clone();

    // A create that committed content and died before its manifest.
    let orphan = ContentHash::of(b"orphaned");
    let Reserve::Miss { reservation } = dedup
        .try_reserve(&orphan, Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("expected miss");
    };
    h.storage
        .put(&orphan.storage_key(), Bytes::from_static(b"orphaned"))
        .await
        .unwrap();
    let object = StoredObject {
        key: orphan.storage_key(),
        compressed: false,
        stored_size: 8,
    };
    dedup
        .commit(&reservation, &object, &RefOwner::new("crashed", "db.t/p/f"))
        .await
        .unwrap();

    // And one that died mid-upload, leaving a reservation behind.
    let dangling = ContentHash::of(b"half uploaded");
    dedup
        .try_reserve(&dangling, Duration::from_millis(1))
        .await
        .unwrap();
    h.storage
        .put(&dangling.storage_key(), Bytes::from_static(b"half"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A finished backup must come through untouched.
    h.database.add_part("db.t", PART_A, &[("data.bin", b"keep me")]);
    let node = h.node("a");
    let kept = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    let report = node.sweep(&cancel()).await.unwrap();
    assert_eq!(report.expired_reservations, 1);
    assert_eq!(report.orphaned_backups, vec!["crashed".to_string()]);
    assert_eq!(report.objects_deleted, 2);
    assert_eq!(report.stray_objects, 1);
    assert_eq!(h.content_keys(), vec![ContentHash::of(b"keep me").storage_key()]);
    assert!(dedup.record(&orphan).await.unwrap().is_none());

    h.database.drop_table("db.t");
    node.restore(&kept.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
}

#[tokio::test]
async fn incremental_backup_reuses_unchanged_parts() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("data.bin", &[9u8; 1000])]);
    let node = h.node("a");
    let full = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    h.database.add_part("db.t", PART_B, &[("data.bin", &[8u8; 500])]);
    let options = CreateOptions {
        incremental: Some(true),
        ..Default::default()
    };
    let inc = node.create(options, &cancel()).await.unwrap();
    assert_eq!(inc.basis.as_deref(), Some(full.backup_id.as_str()));
    assert_eq!(inc.reused_parts, 1);
    assert_eq!(inc.parts, 2);
    assert_eq!(inc.deduplicated_bytes, 1000);
    assert_eq!(h.refcount(&[9u8; 1000]).await, Some(2));

    // The basis cannot be deleted from under its child without force.
    let err = node.delete(&full.backup_id, false, &cancel()).await.unwrap_err();
    assert!(matches!(err, BackupError::PolicyViolation(_)));
    assert!(node.show(&full.backup_id).await.is_ok());

    node.delete(&full.backup_id, true, &cancel()).await.unwrap();
    assert_eq!(h.refcount(&[9u8; 1000]).await, Some(1));

    h.database.drop_table("db.t");
    node.restore(&inc.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(h.database.attached_count(), 2);
}

#[tokio::test]
async fn min_interval_reports_the_recent_backup() {
    let mut h = Harness::new();
    h.config.backup.min_interval = Duration::from_secs(3600);
    h.database.add_part("db.t", PART_A, &[("data.bin", b"x")]);
    let node = h.node("a");

    let first = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    let skipped = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert!(skipped.skipped);
    assert_eq!(skipped.backup_id, first.backup_id);

    let forced = CreateOptions {
        force: true,
        ..Default::default()
    };
    let second = node.create(forced, &cancel()).await.unwrap();
    assert!(!second.skipped);
    assert_eq!(node.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn corrupt_content_aborts_restore_before_attaching() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("a.bin", b"first file")]);
    h.database.add_part("db.t", PART_B, &[("b.bin", b"second file")]);
    let node = h.node("a");
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    h.database.drop_table("db.t");

    h.storage
        .put(
            &ContentHash::of(b"second file").storage_key(),
            Bytes::from_static(b"garbage"),
        )
        .await
        .unwrap();
    let err = node
        .restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::RestoreIncomplete(_)));
    assert_eq!(h.database.attached_count(), 0);
    assert!(!h.database.has_table("db.t"));

    h.storage
        .delete(&ContentHash::of(b"second file").storage_key())
        .await
        .unwrap();
    let err = node
        .restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::RestoreIncomplete(_)));
    assert_eq!(h.database.attached_count(), 0);
}

#[tokio::test]
async fn restore_of_one_table_leaves_others_alone() {
    let h = Harness::new();
    h.database.add_part("db.a", PART_A, &[("data.bin", b"a")]);
    h.database.add_part("db.b", PART_A, &[("data.bin", b"b")]);
    let node = h.node("a");
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    let options = RestoreOptions {
        tables: vec![crate::database::TableRef::new("db", "b")],
        ..Default::default()
    };
    let restored = node.restore(&report.backup_id, options, &cancel()).await.unwrap();
    assert_eq!(restored.tables, 1);
    assert!(h.database.attached_part("db.a", PART_A).is_none());
    assert!(h.database.attached_part("db.b", PART_A).is_some());

    let missing = RestoreOptions {
        tables: vec![crate::database::TableRef::new("db", "nope")],
        ..Default::default()
    };
    assert!(matches!(
        node.restore(&report.backup_id, missing, &cancel()).await.unwrap_err(),
        BackupError::PolicyViolation(_)
    ));
}

#[tokio::test]
async fn cancelled_create_is_rolled_back() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("data.bin", b"never stored")]);
    let node = h.node("a");
    let token = cancel();
    token.cancel();

    let err = node.create(CreateOptions::default(), &token).await.unwrap_err();
    assert!(matches!(err, BackupError::Cancelled(_)));
    assert!(node.list().await.unwrap().is_empty());
    assert!(h.coordination.locks.holder(&scope_resource("test")).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_keeps_basis_of_kept_incremental() {
    let mut h = Harness::new();
    h.config.retention.min_keep = 1;
    h.config.retention.max_age = Some(Duration::from_millis(1));
    h.database.add_part("db.t", PART_A, &[("data.bin", &[1u8; 10])]);
    let node = h.node("a");
    let full = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    h.database.add_part("db.t", PART_B, &[("data.bin", &[2u8; 10])]);
    let options = CreateOptions {
        incremental: Some(true),
        ..Default::default()
    };
    let inc = node.create(options, &cancel()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = node.purge(false, &cancel()).await.unwrap();
    assert!(report.deleted.is_empty());
    let basis = report
        .decisions
        .iter()
        .find(|d| d.backup_id == full.backup_id)
        .unwrap();
    assert!(matches!(
        &basis.decision,
        RetentionDecision::Keep { reasons }
            if reasons.contains(&crate::retention::KeepReason::BasisOf(inc.backup_id.clone()))
    ));
}

/// Storage whose content uploads stall after breaking the scope lock, as
/// when an operator force-unlocks a scope a slow node still works on.
struct LockBreakingStorage {
    inner: std::sync::Arc<crate::storage::MemoryBackend>,
    locks: std::sync::Arc<dyn crate::lock::LockCoordinator>,
    stall: Duration,
}

#[async_trait::async_trait]
impl StorageBackend for LockBreakingStorage {
    fn label(&self) -> &str {
        "lock-breaking"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if key.starts_with(crate::storage::CONTENT_PREFIX) {
            self.locks.break_lock(&scope_resource("test")).await?;
            tokio::time::sleep(self.stall).await;
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<crate::storage::ListPage> {
        self.inner.list_page(prefix, token).await
    }
}

#[tokio::test]
async fn lock_lost_during_upload_aborts_create() {
    let mut h = Harness::new();
    h.config.coordination.lock_lease = Duration::from_millis(300);
    h.database.add_part("db.t", PART_A, &[("data.bin", b"uploaded too late")]);
    let storage = std::sync::Arc::new(LockBreakingStorage {
        inner: h.storage.clone(),
        locks: h.coordination.locks.clone(),
        stall: Duration::from_secs(10),
    });
    let node = Orchestrator::new(
        h.config.clone(),
        storage,
        h.coordination.clone(),
        h.database.clone(),
    )
    .with_holder("a");

    let started = std::time::Instant::now();
    let err = node.create(CreateOptions::default(), &cancel()).await.unwrap_err();
    assert!(matches!(err, BackupError::LockLost(_)), "unexpected error: {err}");
    // Renewal noticed the broken lock well before the stalled upload ended.
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(h.node("b").list().await.unwrap().is_empty());
    assert!(h.content_keys().is_empty());
    assert!(h
        .coordination
        .dedup
        .referencing_backups()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.refcount(b"uploaded too late").await.unwrap_or(0), 0);
    assert!(h.database.frozen_tags().is_empty());

    // The scope is usable again by a healthy node.
    h.config.coordination.lock_lease = Duration::from_secs(5);
    let report = h
        .node("b")
        .create(CreateOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(h.refcount(b"uploaded too late").await, Some(1));
    assert_eq!(report.files, 1);
}

#[tokio::test]
async fn racing_creates_on_one_scope_admit_exactly_one() {
    let h = Harness::sqlite();
    h.database.add_part(
        "db.t",
        PART_A,
        &[("a.bin", &[5u8; 4096]), ("b.bin", &[6u8; 4096])],
    );
    let (a, b) = (h.node("a"), h.node("b"));

    let (ca, cb) = (cancel(), cancel());
    let (first, second) = tokio::join!(
        a.create(CreateOptions::default(), &ca),
        b.create(CreateOptions::default(), &cb),
    );
    let (winner, loser) = match (first, second) {
        (Ok(report), Err(err)) => (report, err),
        (Err(err), Ok(report)) => (report, err),
        (first, second) => panic!("expected one winner, got {first:?} and {second:?}"),
    };
    assert!(matches!(loser, BackupError::LockBusy { .. }), "unexpected error: {loser}");

    let listed = a.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].backup_id, winner.backup_id);
    assert_eq!(h.refcount(&[5u8; 4096]).await, Some(1));
    assert_eq!(h.refcount(&[6u8; 4096]).await, Some(1));
    assert!(h.coordination.locks.holder(&scope_resource("test")).await.unwrap().is_none());
}

#[tokio::test]
async fn restore_refuses_manifest_paths_leaving_staging() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("data.bin", b"payload")]);
    let node = h.node("a");
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    h.database.drop_table("db.t");

    let key = crate::catalog::manifest::manifest_key(&report.backup_id);
    let original = h.storage.get(&key).await.unwrap().unwrap();
    let outside = h.dir.path().join("escaped");

    let tamper: [fn(&mut crate::catalog::PartEntry); 3] = [
        |part| part.files[0].path = "../../../../escaped".into(),
        |part| part.files[0].path = "/tmp/escaped".into(),
        |part| part.name = "../all_1_1_0".into(),
    ];
    for edit in tamper {
        let mut manifest = crate::catalog::BackupManifest::from_json(&original).unwrap();
        edit(&mut manifest.tables[0].parts[0]);
        h.storage
            .put(&key, Bytes::from(manifest.to_json().unwrap()))
            .await
            .unwrap();

        let err = node
            .restore(&report.backup_id, RestoreOptions::default(), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RestoreIncomplete(_)), "unexpected error: {err}");
        assert_eq!(h.database.attached_count(), 0);
        assert!(!outside.exists());
    }
}

#[tokio::test]
async fn restore_recreates_databases_with_their_engine() {
    let h = Harness::new();
    h.database.add_part("replicated_db.t", PART_A, &[("data.bin", b"row")]);
    let schema = "CREATE DATABASE replicated_db ENGINE = Replicated('/clickhouse/db', '{shard}', '{replica}')";
    h.database.set_database_schema("replicated_db", schema);
    let node = h.node("a");
    let report = node.create(CreateOptions::default(), &cancel()).await.unwrap();

    let manifest = node.show(&report.backup_id).await.unwrap();
    assert_eq!(manifest.databases.get("replicated_db").map(String::as_str), Some(schema));

    h.database.drop_database("replicated_db");
    node.restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(h.database.database_schema_of("replicated_db").as_deref(), Some(schema));
    assert!(h.database.attached_part("replicated_db.t", PART_A).is_some());
}

#[tokio::test]
async fn access_entities_are_stored_only_when_asked() {
    let h = Harness::new();
    h.database.add_part("db.t", PART_A, &[("data.bin", b"row")]);
    let entities = [
        "CREATE USER alice IDENTIFIED WITH sha256_hash BY 'ab' SALT 'cd'",
        "CREATE ROLE reader",
        "GRANT SELECT ON db.* TO reader",
        "GRANT reader TO alice",
    ];
    for statement in entities {
        h.database.add_access_entity(statement);
    }
    let node = h.node("a");

    let plain = node.create(CreateOptions::default(), &cancel()).await.unwrap();
    assert!(node.show(&plain.backup_id).await.unwrap().access_control.is_empty());

    let with_access = CreateOptions {
        access_control: true,
        force: true,
        ..Default::default()
    };
    let report = node.create(with_access, &cancel()).await.unwrap();
    assert_eq!(node.show(&report.backup_id).await.unwrap().access_control, entities);

    // Skipped on request.
    h.database.clear_access();
    h.database.drop_table("db.t");
    let skip = RestoreOptions {
        skip_access_control: true,
        ..Default::default()
    };
    node.restore(&report.backup_id, skip, &cancel()).await.unwrap();
    assert!(h.database.access().is_empty());

    h.database.drop_table("db.t");
    node.restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(h.database.access(), entities);

    // Replaying onto a server that already has them changes nothing.
    h.database.drop_table("db.t");
    node.restore(&report.backup_id, RestoreOptions::default(), &cancel())
        .await
        .unwrap();
    assert_eq!(h.database.access(), entities);
}
