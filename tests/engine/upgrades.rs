use crate::common::*;
use appkeeper::engine::model::{Action, ErrorReason, InstallStatus};
use appkeeper::engine::registry::OperateRequest;
use appkeeper::engine::upgrade::parse_version;
use appkeeper::engine::EngineSettings;
use appkeeper::error::ErrorKind;
use appkeeper::runtime::memory::FailPoint;

fn upgrade(id: u64, version: Option<&str>) -> OperateRequest {
    OperateRequest {
        install_id: id,
        action: Action::Upgrade,
        version: version.map(str::to_string),
    }
}

#[tokio::test]
async fn upgrade_moves_version_and_image() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    assert_eq!(reg.get_update_versions(install.id).unwrap(), ["8.0.0"]);

    let upgraded = reg.operate(ACTOR, upgrade(install.id, None)).await.unwrap();
    assert_eq!(upgraded.version, "8.0.0");
    assert_eq!(upgraded.status, InstallStatus::Running);
    assert_eq!(upgraded.pending_upgrade, None);

    let container = h.runtime.container("ak-redis-cache-redis").unwrap();
    assert_eq!(container.image, "redis:8.0.0");
    assert!(container.running);
    assert!(reg.get_update_versions(install.id).unwrap().is_empty());
}

#[tokio::test]
async fn stopped_install_is_upgraded_in_place() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(
        ACTOR,
        OperateRequest {
            install_id: install.id,
            action: Action::Stop,
            version: None,
        },
    )
    .await
    .unwrap();

    let upgraded = reg
        .operate(ACTOR, upgrade(install.id, Some("8.0.0")))
        .await
        .unwrap();
    assert_eq!(upgraded.status, InstallStatus::Stopped);
    assert_eq!(upgraded.version, "8.0.0");
    assert!(!h.runtime.container("ak-redis-cache-redis").unwrap().running);
}

#[tokio::test]
async fn failed_health_check_keeps_the_old_version() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.fail_on(FailPoint::Probe);

    let err = h
        .registry()
        .operate(ACTOR, upgrade(install.id, Some("8.0.0")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);

    let after = h.registry().get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(after.version, "7.2.0");
    assert_eq!(after.pending_upgrade, None);
    match after.error_reason {
        Some(ErrorReason::UpgradeFailed {
            attempted_version, ..
        }) => assert_eq!(attempted_version, "8.0.0"),
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_targets_are_refused() {
    let h = Harness::new();
    let old = h
        .install(
            "redis",
            "old",
            "7.0.0",
            params(&[("REDIS_PASSWORD", serde_json::json!("x"))]),
        )
        .await;
    let reg = h.registry();

    // 8.0.0 needs 7.2.0 first.
    assert_eq!(reg.get_update_versions(old.id).unwrap(), ["7.2.0"]);
    let candidates = reg.upgrade_candidates(old.id).unwrap();
    assert!(candidates
        .iter()
        .any(|c| c.available_version == "8.0.0" && !c.compatible));

    let err = reg
        .operate(ACTOR, upgrade(old.id, Some("8.0.0")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = reg
        .operate(ACTOR, upgrade(old.id, Some("9.9.9")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.status(old.id), InstallStatus::Running);
}

#[tokio::test]
async fn ignored_versions_stay_hidden_until_a_newer_one_ships() {
    let h = Harness::new();
    let install = h.install("gitea", "git", "1.0.0", params(&[])).await;
    let reg = h.registry();
    assert_eq!(reg.get_update_versions(install.id).unwrap(), ["2.0.0"]);

    reg.ignore_upgrade(ACTOR, install.id, "2.0.0").await.unwrap();
    assert!(reg.get_update_versions(install.id).unwrap().is_empty());
    assert!(reg
        .get(install.id)
        .unwrap()
        .ignored_versions
        .contains("2.0.0"));

    // Reopen over the same records with a catalog that knows 2.1.0.
    let newer = format!("{CATALOG}\n[[apps.gitea.versions]]\nversion = \"2.1.0\"\n");
    let reopened = Harness::with(&newer, EngineSettings::default(), h.store.clone());
    assert_eq!(
        reopened.registry().get_update_versions(install.id).unwrap(),
        ["2.1.0"]
    );
}

#[tokio::test]
async fn ignoring_an_unknown_version_fails() {
    let h = Harness::new();
    let install = h.install("gitea", "git", "1.0.0", params(&[])).await;
    let err = h
        .registry()
        .ignore_upgrade(ACTOR, install.id, "7.7.7")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn versions_order_semantically() {
    let v = |s| parse_version(s).unwrap();
    assert!(v("2.0.0-rc1") < v("2.0.0"));
    assert!(v("2.0.0") < v("2.0.1"));
    assert!(v("2.0.1") < v("2.1"));
    assert!(v("v1.9") < v("1.10.0"));
    assert!(parse_version("latest").is_none());
}
