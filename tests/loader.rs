//! Loader Integration Tests
//!
//! Commit protocol behaviour when storage fails at each step of the swap,
//! and recovery of the table afterwards.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use common::FaultyStorage;
use estate_etl::core::LockRegistry;
use estate_etl::domain::NormalizedRecord;
use estate_etl::etl::{LoadError, LoadOutcome, Loader, RecoveryAction, WarehouseTarget};
use estate_etl::storage::{LocalFsStorage, StorageClient};

fn record(sale_id: u64, town: &str) -> NormalizedRecord {
    NormalizedRecord {
        sale_id,
        list_year: 2006,
        town: town.to_string(),
        address: "123 Main St".to_string(),
        assessed_value: 150000.0,
        sale_amount: 200000.0,
        sales_ratio: 0.75,
        property_type: "Residential".to_string(),
    }
}

/// Loader over faulty storage with one committed run already in place
async fn committed() -> (Arc<FaultyStorage>, Loader, Vec<u8>) {
    let storage = Arc::new(FaultyStorage::new());
    let loader = Loader::new(
        storage.clone(),
        WarehouseTarget::default(),
        LockRegistry::new(),
    );

    assert_ok!(loader.load(Uuid::new_v4(), &[record(1, "Hartford")]).await);
    let data = storage
        .read(&loader.target().data_path())
        .await
        .unwrap()
        .to_vec();
    (storage, loader, data)
}

async fn table_data(storage: &FaultyStorage, target: &WarehouseTarget) -> Vec<u8> {
    storage.read(&target.data_path()).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_failed_move_aside_keeps_previous_data() {
    let (storage, loader, before) = committed().await;
    let target = loader.target().clone();
    storage.fail_renames_to(Some(&target.backup_location()));

    let err = assert_err!(loader.load(Uuid::new_v4(), &[record(1, "Bristol")]).await);
    assert!(err.is_transient());

    assert_eq!(table_data(&storage, &target).await, before);
    assert!(!storage.exists(&target.backup_location()).await.unwrap());
}

#[tokio::test]
async fn test_failed_move_into_place_rolls_back() {
    let (storage, loader, before) = committed().await;
    let target = loader.target().clone();
    storage.fail_renames_from(Some(&target.staging_root));

    let run_id = Uuid::new_v4();
    let err = assert_err!(loader.load(run_id, &[record(1, "Bristol")]).await);
    assert!(err.is_transient());

    // Previous table is back in place and no backup is left behind
    assert_eq!(table_data(&storage, &target).await, before);
    assert!(!storage.exists(&target.backup_location()).await.unwrap());

    // A retry of the same run commits once the fault clears
    storage.fail_renames_from(None);
    let report = assert_ok!(loader.load(run_id, &[record(1, "Bristol")]).await);
    assert_eq!(report.outcome, LoadOutcome::Committed);
    assert_ne!(table_data(&storage, &target).await, before);
}

#[tokio::test]
async fn test_interrupted_swap_is_recovered() {
    let (storage, loader, before) = committed().await;
    let target = loader.target().clone();

    // Both the swap and its rollback are refused: only the backup survives
    storage.fail_renames_to(Some(&target.location));
    assert_err!(loader.load(Uuid::new_v4(), &[record(1, "Bristol")]).await);
    assert!(!storage.exists(&target.location).await.unwrap());
    assert!(storage.exists(&target.backup_location()).await.unwrap());

    storage.fail_renames_to(None);
    let action = assert_ok!(loader.recover().await);
    assert_eq!(action, RecoveryAction::RestoredBackup);
    assert_eq!(table_data(&storage, &target).await, before);

    // Nothing left to do on a second pass
    assert_eq!(assert_ok!(loader.recover().await), RecoveryAction::Clean);
}

#[tokio::test]
async fn test_next_load_recovers_before_committing() {
    let (storage, loader, _) = committed().await;
    let target = loader.target().clone();

    storage.fail_renames_to(Some(&target.location));
    assert_err!(loader.load(Uuid::new_v4(), &[record(1, "Bristol")]).await);

    storage.fail_renames_to(None);
    let run_id = Uuid::new_v4();
    let report = assert_ok!(loader.load(run_id, &[record(1, "Salem")]).await);
    assert_eq!(report.outcome, LoadOutcome::Committed);

    let manifest = loader.current_manifest().await.unwrap().unwrap();
    assert_eq!(manifest.run_id, run_id);
    assert!(!storage.exists(&target.backup_location()).await.unwrap());
}

#[tokio::test]
async fn test_verification_failure_is_fatal() {
    let storage = Arc::new(FaultyStorage::new());
    storage.corrupt_reads(true);
    let loader = Loader::new(
        storage.clone(),
        WarehouseTarget::default(),
        LockRegistry::new(),
    );

    let err = assert_err!(loader.load(Uuid::new_v4(), &[record(1, "Hartford")]).await);
    assert!(matches!(err, LoadError::VerificationFailed { .. }));
    assert!(!err.is_transient());
    assert!(!storage.exists(&loader.target().location).await.unwrap());
}

#[tokio::test]
async fn test_local_commit_is_idempotent_on_disk() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(LocalFsStorage::new(temp.path()));
    let locks = LockRegistry::with_lock_dir(temp.path().join("locks"));
    let loader = Loader::new(storage.clone(), WarehouseTarget::default(), locks);

    let run_id = Uuid::new_v4();
    let records = vec![record(1, "Hartford"), record(2, "New Haven")];

    let first = assert_ok!(loader.load(run_id, &records).await);
    assert_eq!(first.outcome, LoadOutcome::Committed);

    let data_file = temp
        .path()
        .join("user/hive/warehouse/real_estate/real_estate_sales.csv");
    let manifest_file = temp
        .path()
        .join("user/hive/warehouse/real_estate/_MANIFEST.json");
    let data = std::fs::read(&data_file).unwrap();
    let manifest = std::fs::read(&manifest_file).unwrap();
    assert!(String::from_utf8_lossy(&data).contains("2,2006,New Haven,"));

    let second = assert_ok!(loader.load(run_id, &records).await);
    assert_eq!(second.outcome, LoadOutcome::AlreadyCommitted);
    assert_eq!(second.sha256, first.sha256);

    assert_eq!(std::fs::read(&data_file).unwrap(), data);
    assert_eq!(std::fs::read(&manifest_file).unwrap(), manifest);

    // Staging and backup are both cleaned up
    assert!(!temp
        .path()
        .join(format!("user/etl/staging/real_estate/{}", run_id))
        .exists());
    assert!(!temp
        .path()
        .join("user/hive/warehouse/real_estate.previous")
        .exists());
}
