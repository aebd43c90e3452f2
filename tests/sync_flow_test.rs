mod common;

use anyhow::Result;
use std::sync::Arc;

use savesync::error::{ErrorCode, Severity};
use savesync::quota::{NotificationKind, QuotaLevel};
use savesync::recovery::{ManualProbe, ServiceMode};
use savesync::save::{OperationJournal, SyncAction, SyncStatus};
use savesync::store::{MemoryStore, SaveStore, SqliteStore};
use savesync::{SaveSync, SyncEvent, UserId};

use common::{TestEnvironment, fast_config, memory_stack};

fn noise(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

#[tokio::test]
async fn test_full_cloud_keeps_saving_on_device() {
    let remote = Arc::new(MemoryStore::new("remote").with_capacity(100));
    let local = Arc::new(MemoryStore::new("local"));
    let sync = SaveSync::builder(remote.clone(), local.clone(), Arc::new(ManualProbe::default()))
        .config(fast_config())
        .build();
    let mut rx = sync.events.subscribe();
    let user = UserId::from("ada");

    let result = sync.coordinator.save(&user, 1, "Boss fight", &noise(400)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.unwrap().sync_status, SyncStatus::Pending);
    assert_eq!(sync.modes.get_mode(), ServiceMode::LocalOnly);
    assert_eq!(remote.metadata_count(), 0);
    assert_eq!(local.metadata_count(), 1);

    let mut warned = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::Message { severity, .. } = event {
            warned |= severity == Severity::High;
        }
    }
    assert!(warned, "player should be told the cloud is full");
}

#[tokio::test]
async fn test_progress_follows_player_between_devices() -> Result<()> {
    let remote = Arc::new(MemoryStore::new("remote"));
    let device = |name: &str| {
        SaveSync::builder(
            remote.clone() as Arc<dyn SaveStore>,
            Arc::new(MemoryStore::new(name)),
            Arc::new(ManualProbe::default()),
        )
        .config(fast_config())
        .build()
    };
    let console = device("console");
    let handheld = device("handheld");
    let user = UserId::from("ada");

    console
        .coordinator
        .save(&user, 1, "Act 1", b"chapter: 1")
        .await
        .into_result()?;
    let loaded = handheld.coordinator.load(&user, 1).await.into_result()?;
    assert_eq!(loaded.data, b"chapter: 1");

    // Played on the train without a connection
    handheld.modes.set_mode(ServiceMode::Offline, "airplane mode");
    let pending = handheld
        .coordinator
        .save(&user, 1, "Act 2", b"chapter: 2")
        .await
        .into_result()?;
    assert_eq!(pending.sync_status, SyncStatus::Pending);
    assert_eq!(
        console.coordinator.load(&user, 1).await.into_result()?.data,
        b"chapter: 1"
    );

    assert!(handheld.coordinator.restore_cloud().await);
    let report = handheld.coordinator.sync_all(&user).await.into_result()?;
    assert_eq!(report.count(SyncAction::Upload), 1);
    assert_eq!(report.failures().count(), 0);

    let synced = console.coordinator.load(&user, 1).await.into_result()?;
    assert_eq!(synced.data, b"chapter: 2");
    assert_eq!(synced.metadata.name, "Act 2");
    Ok(())
}

#[tokio::test]
async fn test_quota_cleanup_removes_least_recent_saves() -> Result<()> {
    let mut config = fast_config();
    config.quota.max_bytes = 500;
    config.quota.auto_cleanup = true;
    config.quota.max_saves_to_keep = 1;
    let stack = memory_stack(config);
    let user = UserId::from("ada");

    for slot in 1..=3 {
        stack
            .sync
            .coordinator
            .save(&user, slot, &format!("Run {slot}"), &noise(300))
            .await
            .into_result()?;
    }

    let status = stack.sync.quota.check_quota(&user).await;
    assert_eq!(status.level, QuotaLevel::Exceeded);

    let remaining = stack.sync.coordinator.list(&user).await.into_result()?;
    let slots: Vec<u32> = remaining.iter().map(|s| s.slot).collect();
    assert_eq!(slots, vec![3]);
    assert_eq!(stack.remote.metadata_count(), 1);

    let kinds: Vec<NotificationKind> = stack
        .sync
        .quota
        .get_notifications()
        .iter()
        .map(|n| n.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![NotificationKind::CleanupCompleted, NotificationKind::Exceeded]
    );

    let after = stack.sync.quota.check_quota(&user).await;
    assert!(after.level < QuotaLevel::Exceeded);
    Ok(())
}

#[tokio::test]
async fn test_outage_with_flaky_probe_fails_over_then_syncs() -> Result<()> {
    let stack = memory_stack(fast_config());
    let user = UserId::from("grace");
    stack.remote.set_available(false);
    stack.probe.set_online(false);

    let saved = stack
        .sync
        .coordinator
        .save(&user, 2, "", b"inventory: lamp")
        .await
        .into_result()?;
    assert_eq!(saved.name, "Slot 2");
    assert_eq!(stack.sync.modes.get_mode(), ServiceMode::Offline);
    assert!(stack.sync.system_status().fallback_mode);

    let refused = stack.sync.coordinator.sync_slot(&user, 2, None).await;
    assert!(!refused.success);

    stack.remote.set_available(true);
    stack.probe.set_online(true);
    assert!(stack.sync.coordinator.restore_cloud().await);
    let decision = stack
        .sync
        .coordinator
        .sync_slot(&user, 2, None)
        .await
        .into_result()?;
    assert_eq!(decision.action, SyncAction::Upload);
    assert_eq!(stack.remote.metadata_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_stack_survives_restart() -> Result<()> {
    let env = TestEnvironment::new()?;
    let open = || -> Result<SaveSync> {
        let remote = SqliteStore::open("remote", &env.path().join("remote.db"))?;
        let local = SqliteStore::open("local", &env.path().join("local.db"))?;
        Ok(SaveSync::builder(
            Arc::new(remote),
            Arc::new(local),
            Arc::new(ManualProbe::default()),
        )
        .config(fast_config())
        .build())
    };
    let user = UserId::from("ada");

    {
        let sync = open()?;
        sync.coordinator
            .save(&user, 5, "Finale", b"ending: true")
            .await
            .into_result()?;
    }

    let sync = open()?;
    let loaded = sync.coordinator.load(&user, 5).await.into_result()?;
    assert_eq!(loaded.data, b"ending: true");
    assert_eq!(loaded.metadata.sync_status, SyncStatus::Synced);

    let missing = sync.coordinator.load(&user, 6).await.into_result().unwrap_err();
    assert_eq!(missing.code, ErrorCode::Unknown);
    assert!(!missing.retryable);
    Ok(())
}

#[tokio::test]
async fn test_journal_records_each_operation() -> Result<()> {
    let env = TestEnvironment::new()?;
    let journal = Arc::new(OperationJournal::always(env.path().join("logs")));
    let sync = SaveSync::builder(
        Arc::new(MemoryStore::new("remote")),
        Arc::new(MemoryStore::new("local")),
        Arc::new(ManualProbe::default()),
    )
    .config(fast_config())
    .journal(journal.clone())
    .build();
    let user = UserId::from("ada");

    sync.coordinator.save(&user, 1, "x", b"data").await;
    sync.coordinator.load(&user, 9).await;

    let logs = journal.get_logs()?;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].operation, "load");
    assert!(!logs[0].success);
    assert_eq!(logs[0].error_code.as_deref(), Some("unknown"));
    assert_eq!(logs[1].operation, "save");
    assert!(logs[1].success);
    assert_eq!(logs[1].slot, Some(1));
    assert_eq!(logs[1].mode, ServiceMode::CloudEnabled);
    Ok(())
}
