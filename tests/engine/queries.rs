use crate::common::*;
use appkeeper::engine::model::{InstallStatus, ResourceKind, ResourceRef};
use appkeeper::engine::registry::{PageRequest, SearchFilter};
use appkeeper::error::ErrorKind;
use serde_json::json;

async fn populated() -> Harness {
    let h = Harness::new();
    h.redis("alpha", 6380).await;
    h.redis("beta", 6381).await;
    h.install("gitea", "git", "2.0.0", params(&[])).await;
    h
}

fn names(page: &appkeeper::engine::registry::SearchPage) -> Vec<&str> {
    page.items.iter().map(|i| i.summary.name.as_str()).collect()
}

#[tokio::test]
async fn search_pages_newest_first() {
    let h = populated().await;
    let reg = h.registry();
    let filter = SearchFilter::default();

    let first = reg
        .search(&filter, PageRequest { page: 1, page_size: 2 }, false)
        .unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(names(&first), ["git", "beta"]);

    let second = reg
        .search(&filter, PageRequest { page: 2, page_size: 2 }, false)
        .unwrap();
    assert_eq!(names(&second), ["alpha"]);

    let beyond = reg
        .search(&filter, PageRequest { page: 5, page_size: 2 }, false)
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total, 3);

    let all = reg
        .search(&filter, PageRequest { page: 0, page_size: 0 }, true)
        .unwrap();
    assert_eq!(all.items.len(), 3);
}

#[tokio::test]
async fn search_filters_combine() {
    let h = populated().await;
    let reg = h.registry();
    let page = PageRequest { page: 1, page_size: 10 };

    let by_app = SearchFilter {
        app_key: Some("redis".into()),
        ..SearchFilter::default()
    };
    assert_eq!(names(&reg.search(&by_app, page, false).unwrap()), ["beta", "alpha"]);

    let by_name = SearchFilter {
        name: Some("ALP".into()),
        ..SearchFilter::default()
    };
    assert_eq!(names(&reg.search(&by_name, page, false).unwrap()), ["alpha"]);

    // gitea is already on its newest version.
    let updatable = SearchFilter {
        has_update: true,
        ..SearchFilter::default()
    };
    assert_eq!(
        names(&reg.search(&updatable, page, false).unwrap()),
        ["beta", "alpha"]
    );

    let stopped = SearchFilter {
        status: Some(InstallStatus::Stopped),
        ..SearchFilter::default()
    };
    assert_eq!(reg.search(&stopped, page, false).unwrap().total, 0);
}

#[tokio::test]
async fn search_lists_bound_websites() {
    let h = populated().await;
    let reg = h.registry();
    let alpha = reg.find("redis", "alpha").unwrap();
    let site = ResourceRef {
        kind: ResourceKind::Website,
        id: "3".into(),
        name: Some("shop.example.com".into()),
    };
    reg.bind_dependency(ACTOR, alpha.id, site.clone()).unwrap();

    let filter = SearchFilter {
        name: Some("alpha".into()),
        ..SearchFilter::default()
    };
    let page = reg
        .search(&filter, PageRequest { page: 1, page_size: 10 }, false)
        .unwrap();
    assert_eq!(page.items[0].websites, vec![site]);
}

#[tokio::test]
async fn zero_page_is_rejected() {
    let h = populated().await;
    let err = h
        .registry()
        .search(
            &SearchFilter::default(),
            PageRequest { page: 0, page_size: 10 },
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn lookups_by_app_and_name() {
    let h = populated().await;
    let reg = h.registry();

    let hit = reg.check_exist("beta", "redis");
    assert!(hit.exists);
    assert_eq!(hit.install.unwrap().name, "beta");
    let miss = reg.check_exist("nope", "redis");
    assert!(!miss.exists && miss.install.is_none());

    assert_eq!(reg.load_port("redis", "beta").unwrap(), 6381);
    // An empty name picks the first install of the app.
    assert_eq!(reg.load_port("redis", "").unwrap(), 6380);
    assert_eq!(
        reg.load_port("redis", "nope").unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let config = reg.get_default_config("redis", "alpha").unwrap();
    assert!(config.contains("port 6380"));

    let alpha = reg.find("redis", "alpha").unwrap();
    let label = reg.describe(alpha.id).unwrap();
    assert_eq!((label.app_key.as_str(), label.name.as_str()), ("redis", "alpha"));
    assert!(reg.delete_check(alpha.id).unwrap().is_empty());
    assert_eq!(reg.list().len(), 3);
}

#[tokio::test]
async fn connection_info_carries_credentials() {
    let h = populated().await;
    let conn = h.registry().load_conn_info("redis", "alpha").unwrap();
    assert_eq!(conn.status, InstallStatus::Running);
    assert_eq!(conn.container_name, "ak-redis-alpha-redis");
    assert_eq!(conn.service_name, "redis");
    assert_eq!(conn.host, "127.0.0.1");
    assert_eq!(conn.port, Some(6380));
    assert_eq!(conn.container_port, Some(6379));
    assert_eq!(conn.username, None);
    assert_eq!(conn.password.as_deref(), Some("s3cret"));
}

#[tokio::test]
async fn services_of_an_app() {
    let h = populated().await;
    let reg = h.registry();

    let services = reg.get_services("redis").unwrap();
    let labels: Vec<&str> = services.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, ["alpha", "beta"]);
    assert_eq!(services[0].value, "redis");
    assert_eq!(services[0].container_name, "ak-redis-alpha-redis");
    assert_eq!(services[0].params["REDIS_PASSWORD"], json!("s3cret"));

    assert!(reg.get_services("wordpress").unwrap().is_empty());
    assert_eq!(
        reg.get_services("nope").unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let layout = reg.template_services("wordpress").unwrap();
    let web = layout.iter().find(|s| s.name == "web").unwrap();
    assert_eq!(web.ports, vec![80]);
    assert!(layout.iter().any(|s| s.name == "db"));
}
