use crate::common::*;
use appkeeper::engine::model::{InstallStatus, Protocol};
use appkeeper::engine::ports::PortOwner;
use appkeeper::engine::registry::{ChangePortRequest, NewInstall};
use appkeeper::error::ErrorKind;
use appkeeper::runtime::memory::{FailPoint, RuntimeCall};
use serde_json::json;

fn change(name: &str, port: u16) -> ChangePortRequest {
    ChangePortRequest {
        app_key: "redis".into(),
        name: name.into(),
        service: None,
        port,
    }
}

fn owner_id(owner: Option<PortOwner>) -> Option<u64> {
    match owner {
        Some(PortOwner::Install { id, .. }) => Some(id),
        _ => None,
    }
}

#[tokio::test]
async fn concurrent_changes_on_distinct_installs_both_succeed() {
    let h = Harness::new();
    let a = h.redis("a", 6380).await;
    let b = h.redis("b", 6381).await;
    let reg = h.registry();

    let (ra, rb) = tokio::join!(
        reg.change_port(ACTOR, change("a", 7001)),
        reg.change_port(ACTOR, change("b", 7002)),
    );
    ra.unwrap();
    rb.unwrap();

    let ports = reg.ports();
    assert_eq!(owner_id(ports.owner(7001, Protocol::Tcp)), Some(a.id));
    assert_eq!(owner_id(ports.owner(7002, Protocol::Tcp)), Some(b.id));
    assert!(ports.owner(6380, Protocol::Tcp).is_none());
    assert!(ports.owner(6381, Protocol::Tcp).is_none());
    assert_eq!(ports.reservations_for(a.id), vec![(7001, Protocol::Tcp)]);
    assert_eq!(ports.reservations_for(b.id), vec![(7002, Protocol::Tcp)]);

    let a = reg.get(a.id).unwrap();
    assert_eq!(a.ports[0].host_port, 7001);
    assert_eq!(a.params["REDIS_PORT"], json!(7001));
    assert!(a.rendered_config.contains("port 7001"));
    assert_eq!(a.status, InstallStatus::Running);
}

#[tokio::test]
async fn racing_for_the_same_port_has_one_winner() {
    let h = Harness::new();
    h.redis("a", 6380).await;
    h.redis("b", 6381).await;
    let reg = h.registry();

    let (ra, rb) = tokio::join!(
        reg.change_port(ACTOR, change("a", 7000)),
        reg.change_port(ACTOR, change("b", 7000)),
    );
    assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
    let loser = ra.err().or(rb.err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::Conflict);
    assert_eq!(reg.ports().len(), 2);
}

#[tokio::test]
async fn changing_to_the_same_port_is_a_no_op() {
    let h = Harness::new();
    let a = h.redis("a", 8080).await;
    let reg = h.registry();

    reg.change_port(ACTOR, change("a", 8080)).await.unwrap();
    assert_eq!(owner_id(reg.ports().owner(8080, Protocol::Tcp)), Some(a.id));
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Recreate(_))), 0);
    assert_eq!(reg.get(a.id).unwrap().ports[0].host_port, 8080);
}

#[tokio::test]
async fn port_taken_by_another_install_is_a_conflict() {
    let h = Harness::new();
    let a = h.redis("a", 6380).await;
    h.redis("b", 6381).await;
    let reg = h.registry();

    let err = reg.change_port(ACTOR, change("a", 6381)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(reg.get(a.id).unwrap().ports[0].host_port, 6380);
    assert_eq!(owner_id(reg.ports().owner(6380, Protocol::Tcp)), Some(a.id));
}

#[tokio::test]
async fn port_zero_is_rejected() {
    let h = Harness::new();
    h.redis("a", 6380).await;
    let err = h
        .registry()
        .change_port(ACTOR, change("a", 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn failed_recreate_keeps_the_old_port() {
    let h = Harness::new();
    let a = h.redis("a", 6380).await;
    let reg = h.registry();
    h.runtime.fail_on(FailPoint::Recreate);

    let err = reg.change_port(ACTOR, change("a", 7000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert!(reg.ports().owner(7000, Protocol::Tcp).is_none());
    assert_eq!(owner_id(reg.ports().owner(6380, Protocol::Tcp)), Some(a.id));
    assert_eq!(reg.get(a.id).unwrap().ports[0].host_port, 6380);
}

#[tokio::test]
async fn store_failure_rolls_the_swap_back() {
    let h = Harness::new();
    let a = h.redis("a", 6380).await;
    let reg = h.registry();
    h.store.set_fail_writes(true);

    let err = reg.change_port(ACTOR, change("a", 7000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreFailure);
    assert!(reg.ports().owner(7000, Protocol::Tcp).is_none());
    assert_eq!(reg.get(a.id).unwrap().ports[0].host_port, 6380);

    // The containers were put back on the old mapping.
    let container = h.runtime.container("ak-redis-a-redis").unwrap();
    assert_eq!(container.ports[0].host_port, 6380);
}

#[tokio::test]
async fn register_refuses_a_reserved_port() {
    let h = Harness::new();
    h.redis("a", 6380).await;
    let err = h
        .registry()
        .register(
            ACTOR,
            NewInstall {
                app_key: "redis".into(),
                name: "b".into(),
                version: "7.2.0".into(),
                params: params(&[
                    ("REDIS_PORT", json!(6380)),
                    ("REDIS_PASSWORD", json!("x")),
                ]),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.registry().list().len(), 1);
}
