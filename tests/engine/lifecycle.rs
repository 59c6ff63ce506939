use crate::common::*;
use appkeeper::engine::model::{Action, ErrorReason, InstallStatus, ResourceKind, ResourceRef};
use appkeeper::engine::operate::Timeouts;
use appkeeper::engine::registry::OperateRequest;
use appkeeper::engine::EngineSettings;
use appkeeper::error::ErrorKind;
use appkeeper::runtime::memory::{FailPoint, RuntimeCall};
use std::time::Duration;

fn op(id: u64, action: Action) -> OperateRequest {
    OperateRequest {
        install_id: id,
        action,
        version: None,
    }
}

#[tokio::test]
async fn start_twice_stays_running() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();

    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();
    assert_eq!(h.status(install.id), InstallStatus::Stopped);

    reg.operate(ACTOR, op(install.id, Action::Start)).await.unwrap();
    reg.operate(ACTOR, op(install.id, Action::Start)).await.unwrap();
    assert_eq!(h.status(install.id), InstallStatus::Running);
    assert_eq!(
        h.runtime.count(|c| matches!(c, RuntimeCall::Start(id) if *id == install.id)),
        1,
        "the second start is a no-op"
    );
}

#[tokio::test]
async fn concurrent_starts_run_once() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();

    let (a, b) = tokio::join!(
        reg.operate(ACTOR, op(install.id, Action::Start)),
        reg.operate(ACTOR, op(install.id, Action::Start)),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.status(install.id), InstallStatus::Running);
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Start(_))), 1);
}

#[tokio::test]
async fn start_failure_moves_to_error() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();

    h.runtime.fail_on(FailPoint::Start);
    let err = reg
        .operate(ACTOR, op(install.id, Action::Start))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);

    let after = reg.get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert!(matches!(after.error_reason, Some(ErrorReason::RuntimeFailure { .. })));

    // Start is allowed again from Error.
    h.runtime.clear_failure(FailPoint::Start);
    reg.operate(ACTOR, op(install.id, Action::Start)).await.unwrap();
    let after = reg.get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Running);
    assert_eq!(after.error_reason, None);
}

#[tokio::test]
async fn restart_with_failing_stop_never_starts() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.runtime.fail_on(FailPoint::Stop);

    let err = h
        .registry()
        .operate(ACTOR, op(install.id, Action::Restart))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert_eq!(h.status(install.id), InstallStatus::Error);
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Start(_))), 0);
}

#[tokio::test]
async fn stopping_a_stopped_install_is_a_no_op() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Stop(_))), 1);
}

#[tokio::test]
async fn restart_of_stopped_install_is_invalid() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();

    let err = reg
        .operate(ACTOR, op(install.id, Action::Restart))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(h.status(install.id), InstallStatus::Stopped);
}

#[tokio::test]
async fn unknown_install_is_not_found() {
    let h = Harness::new();
    let err = h
        .registry()
        .operate(ACTOR, op(42, Action::Start))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn delete_with_dependents_keeps_everything() {
    let h = Harness::new();
    let install = h.install(
        "wordpress",
        "blog",
        "6.4.0",
        params(&[("DB_PASSWORD", serde_json::json!("pw"))]),
    )
    .await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();

    let site = ResourceRef {
        kind: ResourceKind::Website,
        id: "17".into(),
        name: Some("blog.example.com".into()),
    };
    assert!(reg.bind_dependency(ACTOR, install.id, site.clone()).unwrap());

    let err = reg.delete(ACTOR, install.id, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HasDependents);
    assert!(err.to_string().contains("blog.example.com"));

    assert_eq!(h.status(install.id), InstallStatus::Stopped);
    assert!(reg.ports().owner(8080, Default::default()).is_some());
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Remove(_))), 0);
    assert_eq!(reg.delete_check(install.id).unwrap(), vec![site.clone()]);

    assert_eq!(reg.unbind_dependency(ACTOR, &site).unwrap(), Some(install.id));
    reg.delete(ACTOR, install.id, false).await.unwrap();
    assert_eq!(reg.get(install.id).unwrap_err().kind(), ErrorKind::NotFound);
    assert!(reg.ports().owner(8080, Default::default()).is_none());
    assert!(h.store.snapshot().installs.is_empty());
}

#[tokio::test]
async fn delete_of_running_install_is_refused() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let err = h
        .registry()
        .delete(ACTOR, install.id, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(h.status(install.id), InstallStatus::Running);
}

#[tokio::test]
async fn forced_delete_survives_teardown_failure() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();
    h.runtime.fail_on(FailPoint::Remove);

    let err = reg.delete(ACTOR, install.id, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert_eq!(h.status(install.id), InstallStatus::Error);

    reg.delete(ACTOR, install.id, true).await.unwrap();
    assert_eq!(reg.get(install.id).unwrap_err().kind(), ErrorKind::NotFound);
    assert!(reg.ports().owner(6380, Default::default()).is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_runtime_call_times_out_into_error() {
    let mut settings = EngineSettings::default();
    settings.timeouts = Timeouts {
        operation: Duration::from_secs(5),
        ..Timeouts::default()
    };
    let h = Harness::with_settings(settings);
    let install = h.redis("cache", 6380).await;
    h.runtime.set_delay(Some(Duration::from_secs(60)));

    let err = h
        .registry()
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
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    let after = h.registry().get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(after.version, "7.2.0");
    assert_eq!(after.pending_upgrade, None);
}

#[tokio::test]
async fn shutdown_waits_for_tracked_work() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.registry()
        .operate(ACTOR, op(install.id, Action::Stop))
        .await
        .unwrap();
    assert!(h.engine.shutdown(Duration::from_secs(1)).await);

    // Nothing new is accepted once the engine is shutting down.
    let err = h
        .registry()
        .operate(ACTOR, op(install.id, Action::Start))
        .await
        .unwrap_err();
    assert_eq!(h.status(install.id), InstallStatus::Stopped);
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert!(err.to_string().contains("shutting down"));
}

#[tokio::test]
async fn every_mutation_is_audited() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    h.registry()
        .operate(ACTOR, op(install.id, Action::Stop))
        .await
        .unwrap();

    let actions: Vec<String> = h.audit.records().into_iter().map(|r| r.action).collect();
    assert_eq!(actions, ["register", "complete_install", "stop"]);
    let stop = h.audit.records().pop().unwrap();
    assert_eq!(stop.actor, ACTOR);
    assert_eq!(stop.before.get("status").map(String::as_str), Some("running"));
    assert_eq!(stop.after.get("status").map(String::as_str), Some("stopped"));
}

#[tokio::test(start_paused = true)]
async fn store_outage_at_the_end_of_an_upgrade_leaves_an_error() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    h.runtime.set_delay(Some(Duration::from_millis(300)));

    let upgrade = OperateRequest {
        install_id: install.id,
        action: Action::Upgrade,
        version: Some("8.0.0".into()),
    };
    let (result, ()) = tokio::join!(reg.operate(ACTOR, upgrade), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.store.set_fail_writes(true);
    });
    assert_eq!(result.unwrap_err().kind(), ErrorKind::StoreFailure);

    let after = reg.get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(after.version, "7.2.0");
    assert_eq!(after.pending_upgrade, None);
    assert!(matches!(
        after.error_reason,
        Some(ErrorReason::Interrupted { ref during }) if during.contains("upgrade")
    ));
    assert_eq!(
        h.store.snapshot().installs[&install.id].status,
        InstallStatus::Upgrading,
        "the store keeps the in-flight record for startup to resolve"
    );

    // The install is not stuck: it can be operated once the store is back.
    h.store.set_fail_writes(false);
    h.runtime.set_delay(None);
    reg.operate(ACTOR, op(install.id, Action::Start)).await.unwrap();
    assert_eq!(h.status(install.id), InstallStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn store_outage_at_the_end_of_a_delete_keeps_ports_reserved() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    reg.operate(ACTOR, op(install.id, Action::Stop)).await.unwrap();
    h.runtime.set_delay(Some(Duration::from_millis(300)));

    let (result, ()) = tokio::join!(reg.delete(ACTOR, install.id, false), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.store.set_fail_writes(true);
    });
    assert_eq!(result.unwrap_err().kind(), ErrorKind::StoreFailure);

    let after = reg.get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Error);
    assert_eq!(
        after.error_reason,
        Some(ErrorReason::Interrupted {
            during: "delete".into()
        })
    );
    assert!(
        reg.ports().owner(6380, Default::default()).is_some(),
        "ports stay reserved until the deletion is on record"
    );

    h.store.set_fail_writes(false);
    h.runtime.set_delay(None);
    reg.delete(ACTOR, install.id, false).await.unwrap();
    assert_eq!(reg.get(install.id).unwrap_err().kind(), ErrorKind::NotFound);
    assert!(reg.ports().owner(6380, Default::default()).is_none());
}
