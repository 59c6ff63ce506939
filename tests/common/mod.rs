#![allow(dead_code)]
use appkeeper::audit::MemoryAuditSink;
use appkeeper::catalog::Catalog;
use appkeeper::engine::deploy::build_deployment;
use appkeeper::engine::model::{Install, InstallId, InstallStatus, Params};
use appkeeper::engine::registry::{InstallRegistry, NewInstall};
use appkeeper::engine::{Engine, EngineSettings};
use appkeeper::runtime::memory::MemoryRuntime;
use appkeeper::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const ACTOR: &str = "tester";

pub const CATALOG: &str = r#"
[apps.redis]
name = "Redis"
kind = "runtime"
config_template = """
port {{ REDIS_PORT }}
requirepass {{ REDIS_PASSWORD }}
maxmemory {{ MAXMEMORY }}mb
"""
credentials = { password = "REDIS_PASSWORD" }

[apps.redis.services.redis]
image = "redis:{{ version }}"
ports = [{ container_port = 6379, param = "REDIS_PORT" }]

[[apps.redis.params]]
key = "REDIS_PORT"
type = "port"
default = 6379

[[apps.redis.params]]
key = "REDIS_PASSWORD"
type = "password"
required = true

[[apps.redis.params]]
key = "MAXMEMORY"
type = "number"
default = 256

[[apps.redis.versions]]
version = "7.0.0"
[[apps.redis.versions]]
version = "7.2.0"
[[apps.redis.versions]]
version = "8.0.0"
min_upgrade_from = "7.2.0"

[apps.wordpress]
name = "WordPress"
kind = "website"
config_template = "DB_PASSWORD={{ DB_PASSWORD }}"
credentials = { username = "DB_USER", password = "DB_PASSWORD" }

[apps.wordpress.services.web]
image = "wordpress:{{ version }}"
depends_on = ["db"]
ports = [{ container_port = 80, param = "HTTP_PORT" }]

[apps.wordpress.services.db]
image = "mariadb:11"
env = { MARIADB_PASSWORD = "{{ DB_PASSWORD }}" }
volumes = ["data:/var/lib/mysql"]

[[apps.wordpress.params]]
key = "HTTP_PORT"
type = "port"
default = 8080

[[apps.wordpress.params]]
key = "DB_USER"
default = "wp"
editable = false

[[apps.wordpress.params]]
key = "DB_PASSWORD"
type = "password"
required = true

[[apps.wordpress.versions]]
version = "6.4.0"
[[apps.wordpress.versions]]
version = "6.5.0"

[apps.gitea]
name = "Gitea"

[apps.gitea.services.gitea]
image = "gitea/gitea:{{ version }}"
ports = [{ container_port = 3000, param = "HTTP_PORT" }]

[[apps.gitea.params]]
key = "HTTP_PORT"
type = "port"
default = 3000

[[apps.gitea.versions]]
version = "1.0.0"
[[apps.gitea.versions]]
version = "2.0.0"
"#;

/// An engine over in-memory collaborators that tests can poke at.
pub struct Harness {
    pub engine: Engine,
    pub catalog: Arc<Catalog>,
    pub runtime: Arc<MemoryRuntime>,
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(CATALOG, EngineSettings::default(), Arc::new(MemoryStore::new()))
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::with(CATALOG, settings, Arc::new(MemoryStore::new()))
    }

    pub fn with(catalog: &str, settings: EngineSettings, store: Arc<MemoryStore>) -> Self {
        Self::with_runtime(catalog, settings, store, Arc::new(MemoryRuntime::new()))
    }

    pub fn with_runtime(
        catalog: &str,
        settings: EngineSettings,
        store: Arc<MemoryStore>,
        runtime: Arc<MemoryRuntime>,
    ) -> Self {
        let catalog = Arc::new(Catalog::from_toml(catalog).unwrap());
        let audit = Arc::new(MemoryAuditSink::default());
        let engine = Engine::open(
            settings,
            catalog.clone(),
            store.clone(),
            runtime.clone(),
            audit.clone(),
        )
        .unwrap();
        Self {
            engine,
            catalog,
            runtime,
            store,
            audit,
        }
    }

    pub fn registry(&self) -> &InstallRegistry {
        self.engine.registry()
    }

    /// Register, complete and create containers for an install, the way the
    /// installer would.
    pub async fn install(&self, app_key: &str, name: &str, version: &str, params: Params) -> Install {
        let registered = self
            .registry()
            .register(
                ACTOR,
                NewInstall {
                    app_key: app_key.to_string(),
                    name: name.to_string(),
                    version: version.to_string(),
                    params,
                },
            )
            .unwrap();
        let install = self
            .registry()
            .complete_install(ACTOR, registered.id, None)
            .await
            .unwrap();
        let template = self.catalog.template(app_key).unwrap();
        let deployment = build_deployment(&install, template, &install.version).unwrap();
        self.runtime.seed(&deployment, true);
        install
    }

    pub async fn redis(&self, name: &str, port: u16) -> Install {
        self.install(
            "redis",
            name,
            "7.2.0",
            params(&[
                ("REDIS_PORT", serde_json::json!(port)),
                ("REDIS_PASSWORD", serde_json::json!("s3cret")),
            ]),
        )
        .await
    }

    pub fn status(&self, id: InstallId) -> InstallStatus {
        self.registry().get(id).unwrap().status
    }
}

pub fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// A config file and catalog in a scratch directory, for CLI tests.
pub struct TestProject {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProject {
    pub fn new(config_toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("appkeeper.toml");
        std::fs::write(&config_path, config_toml).unwrap();
        std::fs::write(dir.path().join("catalog.toml"), CATALOG).unwrap();
        Self { dir, config_path }
    }
}
