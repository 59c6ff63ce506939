use crate::common::*;
use appkeeper::engine::model::{Action, InstallStatus};
use appkeeper::engine::registry::OperateRequest;
use appkeeper::error::ErrorKind;
use appkeeper::runtime::memory::RuntimeCall;
use serde_json::json;

#[tokio::test]
async fn updated_params_read_back_with_rendered_config() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();

    let mut next = reg.get_params(install.id).unwrap().params;
    assert_eq!(next["MAXMEMORY"], json!(256), "defaults are filled in");
    next.insert("MAXMEMORY".into(), json!(512));

    let outcome = reg
        .update_params(ACTOR, install.id, next.clone())
        .await
        .unwrap();
    assert_eq!(outcome.changed_keys, vec!["MAXMEMORY".to_string()]);
    assert!(outcome.restart_required);

    let config = reg.get_params(install.id).unwrap();
    assert_eq!(config.params, next);
    assert!(config.rendered_config.contains("maxmemory 512mb"));
    assert!(config.fields.iter().any(|f| f.key == "REDIS_PASSWORD"));
}

#[tokio::test]
async fn stopped_install_needs_no_restart() {
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

    let mut next = reg.get_params(install.id).unwrap().params;
    next.insert("REDIS_PASSWORD".into(), json!("rotated"));
    let outcome = reg.update_params(ACTOR, install.id, next).await.unwrap();
    assert!(!outcome.restart_required);
    assert!(reg
        .get(install.id)
        .unwrap()
        .rendered_config
        .contains("requirepass rotated"));
}

#[tokio::test]
async fn port_params_only_move_through_change_port() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();

    let mut next = reg.get_params(install.id).unwrap().params;
    next.insert("REDIS_PORT".into(), json!(7000));
    let err = reg.update_params(ACTOR, install.id, next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("change-port"), "{err}");
    assert_eq!(reg.get(install.id).unwrap().params["REDIS_PORT"], json!(6380));
}

#[tokio::test]
async fn read_only_params_cannot_change() {
    let h = Harness::new();
    let install = h
        .install(
            "wordpress",
            "blog",
            "6.4.0",
            params(&[("DB_PASSWORD", json!("pw"))]),
        )
        .await;
    let reg = h.registry();

    let mut next = reg.get_params(install.id).unwrap().params;
    assert_eq!(next["DB_USER"], json!("wp"));
    next.insert("DB_USER".into(), json!("admin"));
    let err = reg.update_params(ACTOR, install.id, next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn missing_required_param_is_rejected() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();

    let mut next = reg.get_params(install.id).unwrap().params;
    next.remove("REDIS_PASSWORD");
    let err = reg.update_params(ACTOR, install.id, next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn store_failure_leaves_params_untouched() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    let before = reg.get(install.id).unwrap();

    let mut next = before.params.clone();
    next.insert("MAXMEMORY".into(), json!(1024));
    h.store.set_fail_writes(true);
    let err = reg.update_params(ACTOR, install.id, next).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreFailure);

    let after = reg.get(install.id).unwrap();
    assert_eq!(after.params, before.params);
    assert_eq!(after.rendered_config, before.rendered_config);

    let last = h.audit.records().pop().unwrap();
    assert_eq!(last.action, "update_params");
    assert!(!last.succeeded);
}

#[tokio::test]
async fn restart_recreates_containers_with_updated_params() {
    let h = Harness::new();
    let install = h
        .install(
            "wordpress",
            "blog",
            "6.4.0",
            params(&[("DB_PASSWORD", json!("old"))]),
        )
        .await;
    let reg = h.registry();

    let mut next = reg.get_params(install.id).unwrap().params;
    next.insert("DB_PASSWORD".into(), json!("new"));
    let outcome = reg.update_params(ACTOR, install.id, next).await.unwrap();
    assert!(outcome.restart_required);
    assert!(reg.get(install.id).unwrap().redeploy_pending);

    reg.operate(
        ACTOR,
        OperateRequest {
            install_id: install.id,
            action: Action::Restart,
            version: None,
        },
    )
    .await
    .unwrap();

    let db = h.runtime.container("ak-wordpress-blog-db").unwrap();
    assert!(db.running);
    assert_eq!(db.env["MARIADB_PASSWORD"], "new");
    assert!(db.env["APPKEEPER_CONFIG"].contains("DB_PASSWORD=new"));
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Recreate(_))), 1);

    let after = reg.get(install.id).unwrap();
    assert_eq!(after.status, InstallStatus::Running);
    assert!(!after.redeploy_pending);

    // Once applied, a restart is a plain stop and start again.
    reg.operate(
        ACTOR,
        OperateRequest {
            install_id: install.id,
            action: Action::Restart,
            version: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Recreate(_))), 1);
}

#[tokio::test]
async fn start_applies_params_changed_while_stopped() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();
    let request = |action| OperateRequest {
        install_id: install.id,
        action,
        version: None,
    };
    reg.operate(ACTOR, request(Action::Stop)).await.unwrap();

    let mut next = reg.get_params(install.id).unwrap().params;
    next.insert("REDIS_PASSWORD".into(), json!("rotated"));
    reg.update_params(ACTOR, install.id, next).await.unwrap();
    let stale = h.runtime.container("ak-redis-cache-redis").unwrap();
    assert!(stale.env["APPKEEPER_CONFIG"].contains("requirepass s3cret"));

    reg.operate(ACTOR, request(Action::Start)).await.unwrap();
    let fresh = h.runtime.container("ak-redis-cache-redis").unwrap();
    assert!(fresh.running);
    assert!(fresh.env["APPKEEPER_CONFIG"].contains("requirepass rotated"));
    assert!(!reg.get(install.id).unwrap().redeploy_pending);
}

#[tokio::test]
async fn unchanged_params_need_no_redeploy() {
    let h = Harness::new();
    let install = h.redis("cache", 6380).await;
    let reg = h.registry();

    let same = reg.get_params(install.id).unwrap().params;
    let outcome = reg.update_params(ACTOR, install.id, same).await.unwrap();
    assert!(outcome.changed_keys.is_empty());
    assert!(!outcome.restart_required);
    assert!(!reg.get(install.id).unwrap().redeploy_pending);
}
