use crate::common::*;
use appkeeper::engine::model::{Action, ErrorReason, InstallStatus};
use appkeeper::engine::registry::OperateRequest;
use appkeeper::runtime::memory::FailPoint;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn missing_containers_become_an_error() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.drop_container("ak-redis-cache-redis");

    let report = h.registry().sync_all(true).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.corrected, 1);
    let entry = &report.discrepancies[0];
    assert_eq!(entry.recorded, InstallStatus::Running);
    assert_eq!(entry.corrected_to, Some(InstallStatus::Error));

    let after = h.registry().get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(after.error_reason, Some(ErrorReason::ServicesMissing));
    // Only status moves; the rest of the record is left alone.
    assert_eq!(after.params, install.params);
    assert_eq!(after.ports, install.ports);
    assert_eq!(after.version, install.version);
}

#[tokio::test]
async fn containers_stopped_outside_the_engine_are_noticed() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.set_running("ak-redis-cache-redis", false);

    h.registry().sync_all(true).await;
    assert_eq!(h.status(install.id), InstallStatus::Stopped);

    // And started again.
    h.runtime.set_running("ak-redis-cache-redis", true);
    let report = h.registry().sync_all(true).await;
    assert_eq!(report.corrected, 1);
    assert_eq!(h.status(install.id), InstallStatus::Running);
}

#[tokio::test]
async fn partially_running_install_is_degraded() {
    let h = Harness::new();
    let install = h
        .install(
            "wordpress",
            "blog",
            "6.4.0",
            params(&[("DB_PASSWORD", json!("pw"))]),
        )
        .await;
    h.runtime.set_running("ak-wordpress-blog-db", false);

    h.registry().sync_all(true).await;
    let after = h.registry().get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(
        after.error_reason,
        Some(ErrorReason::Degraded {
            running: 1,
            total: 2
        })
    );
}

#[tokio::test]
async fn matching_state_reports_nothing() {
    let h = Harness::new();
    h.redis("cache", 6380).await;
    let report = h.registry().sync_all(true).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.corrected, 0);
    assert!(report.discrepancies.is_empty());
}

#[tokio::test]
async fn debounce_skips_recently_checked_installs() {
    let h = Harness::new();
    h.redis("a", 6380).await;
    h.redis("b", 6381).await;
    let reg = h.registry();

    let first = reg.sync_installed().await;
    assert_eq!((first.checked, first.skipped), (2, 0));

    let second = reg.sync_installed().await;
    assert_eq!((second.checked, second.skipped), (0, 2));

    let forced = reg.sync_all(true).await;
    assert_eq!((forced.checked, forced.skipped), (2, 0));
}

#[tokio::test(start_paused = true)]
async fn overlapping_sweeps_run_once() {
    let h = Harness::new();
    h.redis("cache", 6380).await;
    h.runtime.set_delay(Some(Duration::from_secs(1)));
    let reg = h.registry();

    let (a, b) = tokio::join!(reg.sync_all(true), reg.sync_all(true));
    assert!(!a.sweep_skipped);
    assert_eq!(a.checked, 1);
    assert!(b.sweep_skipped);
    assert_eq!(b.checked, 0);

    // The guard is released once the first sweep ends.
    let c = reg.sync_all(true).await;
    assert!(!c.sweep_skipped);
}

#[tokio::test]
async fn inspect_failure_is_reported_not_applied() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.fail_on(FailPoint::Inspect);

    let report = h.registry().sync_all(true).await;
    assert_eq!(report.corrected, 0);
    let entry = &report.discrepancies[0];
    assert!(entry.observed.contains("inspect failed"), "{}", entry.observed);
    assert_eq!(entry.corrected_to, None);
    assert_eq!(h.status(install.id), InstallStatus::Running);
}

#[tokio::test]
async fn failed_upgrades_are_left_for_the_operator() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.fail_on(FailPoint::Probe);
    h.registry()
        .operate(
            ACTOR,
            OperateRequest {
                install_id: install.id,
                action: Action::Upgrade,
                version: Some("8.0.0".into()),
            },
        )
        .await
        .unwrap_err();

    let report = h.registry().sync_all(true).await;
    assert_eq!((report.checked, report.skipped), (0, 1));
    let after = h.registry().get(install.id).unwrap();
    assert!(matches!(
        after.error_reason,
        Some(ErrorReason::UpgradeFailed { .. })
    ));
}
