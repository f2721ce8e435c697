use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use kira_refdata_manager::config::SnapshotPolicy;
use kira_refdata_manager::domain::SnapshotDate;
use kira_refdata_manager::error::RdmError;
use kira_refdata_manager::snapshot::{SnapshotManager, resolve_snapshot};

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn seed_snapshot(root: &Utf8PathBuf, date: &str) {
    let dir = root.join(date);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("MANIFEST.txt"), date).unwrap();
}

#[test]
fn resolves_nearest_earlier_snapshot() {
    let (_temp, root) = temp_root();
    seed_snapshot(&root, "2024-01-01");
    seed_snapshot(&root, "2024-01-10");
    fs::create_dir_all(root.join("not-a-date")).unwrap();
    fs::create_dir_all(root.join("2024-02-31")).unwrap();

    assert_eq!(
        resolve_snapshot(&root, "2024-01-07").unwrap(),
        root.join("2024-01-01")
    );
    assert_eq!(
        resolve_snapshot(&root, "2024-01-10").unwrap(),
        root.join("2024-01-10")
    );
    assert_eq!(
        resolve_snapshot(&root, "2025-06-01").unwrap(),
        root.join("2024-01-10")
    );
    assert_matches!(
        resolve_snapshot(&root, "2023-12-31"),
        Err(RdmError::SnapshotNotFound(_))
    );
}

#[test]
fn rejects_malformed_dates() {
    let (_temp, root) = temp_root();
    seed_snapshot(&root, "2024-01-01");
    for requested in ["2024-1-7", "07-01-2024", "yesterday", ""] {
        assert_matches!(
            resolve_snapshot(&root, requested),
            Err(RdmError::InvalidDate(_)),
            "{requested}"
        );
    }
}

#[test]
fn empty_snapshot_is_an_error() {
    let (_temp, root) = temp_root();
    fs::create_dir_all(root.join("2024-01-01")).unwrap();
    assert_matches!(
        resolve_snapshot(&root, "2024-01-02"),
        Err(RdmError::SnapshotEmpty(_))
    );
}

#[test]
fn missing_backup_root_means_no_snapshot() {
    let (_temp, root) = temp_root();
    assert_matches!(
        resolve_snapshot(&root.join("absent"), "2024-01-02"),
        Err(RdmError::SnapshotNotFound(_))
    );
}

#[test]
fn same_day_snapshot_is_replaced() {
    let (_temp, root) = temp_root();
    let backup = root.join("backup");
    let first = root.join("first");
    let second = root.join("second");
    fs::create_dir_all(&first).unwrap();
    fs::create_dir_all(&second).unwrap();
    fs::write(first.join("MANIFEST.txt"), "first run").unwrap();
    fs::write(first.join("README"), "first readme").unwrap();
    fs::write(second.join("MANIFEST.txt"), "second run").unwrap();

    let manager = SnapshotManager::new(backup.clone(), SnapshotPolicy::ManifestOnly);
    let day: SnapshotDate = "2024-05-02".parse().unwrap();
    manager
        .create_snapshot(day, &first, &["MANIFEST.txt".to_string(), "README".to_string()])
        .unwrap();
    let path = manager
        .create_snapshot(day, &second, &["MANIFEST.txt".to_string(), "README".to_string()])
        .unwrap();

    assert_eq!(path, backup.join("2024-05-02"));
    assert_eq!(manager.list().unwrap(), vec![day]);
    assert_eq!(fs::read_to_string(path.join("MANIFEST.txt")).unwrap(), "second run");
    assert!(!path.join("README").exists());
    let entries: Vec<_> = backup.read_dir_utf8().unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn manifest_only_skips_bulk_data() {
    let (_temp, root) = temp_root();
    let live = root.join("live");
    fs::create_dir_all(&live).unwrap();
    fs::write(live.join("MANIFEST.txt"), "manifest").unwrap();
    fs::write(live.join("nt.00.tar.gz"), vec![0u8; 4096]).unwrap();

    let manager = SnapshotManager::new(root.join("backup"), SnapshotPolicy::ManifestOnly);
    let path = manager
        .create_snapshot(
            "2024-05-02".parse().unwrap(),
            &live,
            &["MANIFEST.txt".to_string()],
        )
        .unwrap();
    assert!(path.join("MANIFEST.txt").is_file());
    assert!(!path.join("nt.00.tar.gz").exists());
}

#[test]
fn full_copy_policy_keeps_everything() {
    let (_temp, root) = temp_root();
    let live = root.join("live");
    fs::create_dir_all(live.join("sub")).unwrap();
    fs::write(live.join("MANIFEST.txt"), "manifest").unwrap();
    fs::write(live.join("sub/data.bin"), "payload").unwrap();

    let manager = SnapshotManager::new(root.join("backup"), SnapshotPolicy::FullCopy);
    let path = manager
        .create_snapshot("2024-05-02".parse().unwrap(), &live, &[])
        .unwrap();
    assert_eq!(fs::read_to_string(path.join("sub/data.bin")).unwrap(), "payload");
    assert!(path.join("MANIFEST.txt").is_file());
}

#[test]
fn list_is_sorted_and_skips_foreign_dirs() {
    let (_temp, root) = temp_root();
    seed_snapshot(&root, "2024-03-01");
    seed_snapshot(&root, "2023-11-30");
    seed_snapshot(&root, "2024-01-15");
    fs::create_dir_all(root.join("scratch")).unwrap();
    fs::write(root.join("2024-04-01"), "a file, not a snapshot").unwrap();

    let manager = SnapshotManager::new(root.clone(), SnapshotPolicy::ManifestOnly);
    let dates: Vec<String> = manager
        .list()
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(dates, vec!["2023-11-30", "2024-01-15", "2024-03-01"]);
}

#[test]
fn names_with_whitespace_are_not_snapshots() {
    let (_temp, root) = temp_root();
    seed_snapshot(&root, "2024-01-01");
    seed_snapshot(&root, "2024-01-07 ");
    seed_snapshot(&root, " 2024-01-05");

    let manager = SnapshotManager::new(root.clone(), SnapshotPolicy::ManifestOnly);
    let dates: Vec<String> = manager
        .list()
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(dates, vec!["2024-01-01"]);
    assert_eq!(
        resolve_snapshot(&root, "2024-01-08").unwrap(),
        root.join("2024-01-01")
    );
}

fn same_day_fixture(root: &Utf8PathBuf) -> (SnapshotManager, SnapshotDate, Utf8PathBuf) {
    let backup = root.join("backup");
    let update = root.join("update");
    fs::create_dir_all(&update).unwrap();
    fs::write(update.join("MANIFEST.txt"), "second run").unwrap();
    let day: SnapshotDate = "2024-05-02".parse().unwrap();
    let earlier = backup.join("2024-05-02");
    fs::create_dir_all(&earlier).unwrap();
    fs::write(earlier.join("MANIFEST.txt"), "first run").unwrap();
    fs::write(earlier.join("README"), "first readme").unwrap();
    (
        SnapshotManager::new(backup, SnapshotPolicy::ManifestOnly),
        day,
        update,
    )
}

#[test]
fn rolled_back_snapshot_restores_same_day_predecessor() {
    let (_temp, root) = temp_root();
    let (manager, day, update) = same_day_fixture(&root);

    let pending = manager
        .stage_snapshot(day, &update, &["MANIFEST.txt".to_string()])
        .unwrap();
    let path = pending.path().to_path_buf();
    assert_eq!(fs::read_to_string(path.join("MANIFEST.txt")).unwrap(), "second run");
    assert_eq!(manager.list().unwrap(), vec![day]);

    pending.rollback();
    assert_eq!(fs::read_to_string(path.join("MANIFEST.txt")).unwrap(), "first run");
    assert_eq!(fs::read_to_string(path.join("README")).unwrap(), "first readme");
    let entries: Vec<_> = manager.backup_dir().read_dir_utf8().unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn dropped_pending_snapshot_rolls_back() {
    let (_temp, root) = temp_root();
    let (manager, day, update) = same_day_fixture(&root);

    drop(
        manager
            .stage_snapshot(day, &update, &["MANIFEST.txt".to_string()])
            .unwrap(),
    );
    let path = manager.backup_dir().join("2024-05-02");
    assert_eq!(fs::read_to_string(path.join("MANIFEST.txt")).unwrap(), "first run");
}

#[test]
fn committed_snapshot_discards_predecessor() {
    let (_temp, root) = temp_root();
    let (manager, day, update) = same_day_fixture(&root);

    let pending = manager
        .stage_snapshot(day, &update, &["MANIFEST.txt".to_string()])
        .unwrap();
    let path = pending.path().to_path_buf();
    pending.commit();

    assert_eq!(fs::read_to_string(path.join("MANIFEST.txt")).unwrap(), "second run");
    assert!(!path.join("README").exists());
    let entries: Vec<_> = manager.backup_dir().read_dir_utf8().unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn rollback_without_predecessor_leaves_nothing() {
    let (_temp, root) = temp_root();
    let update = root.join("update");
    fs::create_dir_all(&update).unwrap();
    fs::write(update.join("MANIFEST.txt"), "only run").unwrap();
    let manager = SnapshotManager::new(root.join("backup"), SnapshotPolicy::ManifestOnly);

    let pending = manager
        .stage_snapshot(
            "2024-05-02".parse().unwrap(),
            &update,
            &["MANIFEST.txt".to_string()],
        )
        .unwrap();
    pending.rollback();
    assert!(manager.list().unwrap().is_empty());
}
