use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::audit::{AuditRecord, AuditSink};
use crate::catalog::{Catalog, ServiceInfo};
use crate::engine::deploy::{build_deployment, port_bindings, service_records};
use crate::engine::deps::DependencyIndex;
use crate::engine::locks::InstallLocks;
use crate::engine::model::{
    Action, DependencyRecord, ErrorReason, Install, InstallId, InstallLabel, InstallStatus,
    InstalledSummary, Params, ResourceKind, ResourceRef,
};
use crate::engine::operate::OperationStateMachine;
use crate::engine::params::{self, AppConfig, UpdateOutcome};
use crate::engine::ports::{PortAllocator, PortOwner};
use crate::engine::records::Records;
use crate::engine::sync::{SyncReconciler, SyncReport};
use crate::engine::upgrade::{UpgradeCandidate, UpgradeResolver};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Requests and projections
// ---------------------------------------------------------------------------

/// An install whose containers the installer is about to create.
#[derive(Debug, Clone, Deserialize)]
pub struct NewInstall {
    pub app_key: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    /// Case-insensitive substring of the install name.
    pub name: Option<String>,
    pub app_key: Option<String>,
    pub status: Option<InstallStatus>,
    /// Only installs with at least one reachable upgrade.
    #[serde(default)]
    pub has_update: bool,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    #[serde(flatten)]
    pub summary: InstalledSummary,
    pub can_update: bool,
    /// Websites bound to the install.
    pub websites: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExistCheck {
    pub exists: bool,
    pub install: Option<InstalledSummary>,
}

/// How another service reaches an install.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub status: InstallStatus,
    /// Container name of the primary service, resolvable on the install network.
    pub container_name: String,
    pub service_name: String,
    /// Host address of the server itself.
    pub host: String,
    pub port: Option<u16>,
    pub container_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One install of an app, as offered to resources that want to use it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    pub label: String,
    pub value: String,
    pub container_name: String,
    pub status: InstallStatus,
    pub params: Params,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperateRequest {
    pub install_id: InstallId,
    pub action: Action,
    /// Upgrade target; the newest reachable version when omitted.
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePortRequest {
    pub app_key: String,
    pub name: String,
    /// Service whose port moves; the primary port when omitted.
    #[serde(default)]
    pub service: Option<String>,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// InstallRegistry
// ---------------------------------------------------------------------------

/// Everything the registry coordinates, wired once by the engine.
pub struct RegistryParts {
    pub catalog: Arc<Catalog>,
    pub records: Arc<Records>,
    pub ports: Arc<PortAllocator>,
    pub deps: Arc<DependencyIndex>,
    pub locks: Arc<InstallLocks>,
    pub machine: Arc<OperationStateMachine>,
    pub sync: Arc<SyncReconciler>,
    pub audit: Arc<dyn AuditSink>,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
    pub max_operations: usize,
    pub host: String,
}

struct Inner {
    catalog: Arc<Catalog>,
    records: Arc<Records>,
    ports: Arc<PortAllocator>,
    deps: Arc<DependencyIndex>,
    locks: Arc<InstallLocks>,
    machine: Arc<OperationStateMachine>,
    sync: Arc<SyncReconciler>,
    audit: Arc<dyn AuditSink>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    host: String,
    /// Serializes the name check and insert of new installs.
    register_lock: Mutex<()>,
}

/// The only entry point for callers. Owns the install records and routes
/// every request through the component responsible for it.
#[derive(Clone)]
pub struct InstallRegistry {
    inner: Arc<Inner>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl InstallRegistry {
    pub fn new(parts: RegistryParts) -> Self {
        let permits = Arc::new(Semaphore::new(parts.max_operations.max(1)));
        Self {
            inner: Arc::new(Inner {
                catalog: parts.catalog,
                records: parts.records,
                ports: parts.ports,
                deps: parts.deps,
                locks: parts.locks,
                machine: parts.machine,
                sync: parts.sync,
                audit: parts.audit,
                tracker: parts.tracker,
                cancel: parts.cancel,
                permits,
                host: parts.host,
                register_lock: Mutex::new(()),
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    fn audit(&self, record: AuditRecord) {
        self.inner.audit.record(record);
    }

    /// Run `work` as a tracked task holding an operation permit. The work
    /// completes even if the caller stops waiting for it.
    async fn run_tracked<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(InstallRegistry) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::Runtime {
                detail: "engine is shutting down".to_string(),
            });
        }
        let registry = self.clone();
        let handle = self.inner.tracker.spawn(async move {
            let _permit = registry
                .inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Runtime {
                    detail: "engine is shutting down".to_string(),
                })?;
            work(registry).await
        });
        handle.await.map_err(|e| EngineError::Runtime {
            detail: format!("operation task failed: {e}"),
        })?
    }

    // -- lookups ----------------------------------------------------------

    pub fn get(&self, id: InstallId) -> Result<Install> {
        self.inner.records.get(id)
    }

    /// Read-only identity of an install for audit entries.
    pub fn describe(&self, id: InstallId) -> Result<InstallLabel> {
        Ok(self.get(id)?.label())
    }

    /// Install of `app_key` called `name`. An empty name selects the first
    /// install of that app.
    pub fn find(&self, app_key: &str, name: &str) -> Option<Install> {
        self.inner
            .records
            .find(|i| i.app_key == app_key && (name.is_empty() || i.name == name))
    }

    fn find_required(&self, app_key: &str, name: &str) -> Result<Install> {
        self.find(app_key, name).ok_or_else(|| {
            if name.is_empty() {
                EngineError::not_found(format!("install of app '{app_key}'"))
            } else {
                EngineError::not_found(format!("install '{name}' of app '{app_key}'"))
            }
        })
    }

    pub fn list(&self) -> Vec<InstalledSummary> {
        self.inner
            .records
            .all()
            .iter()
            .filter(|i| i.status != InstallStatus::Deleted)
            .map(Install::summary)
            .collect()
    }

    fn can_update(&self, install: &Install) -> bool {
        self.inner
            .catalog
            .get(&install.app_key)
            .is_some_and(|t| !UpgradeResolver::new(t).update_versions(install).is_empty())
    }

    /// Filtered listing, newest first. `all` returns every match unpaged.
    pub fn search(&self, filter: &SearchFilter, page: PageRequest, all: bool) -> Result<SearchPage> {
        if !all && (page.page == 0 || page.page_size == 0) {
            return Err(EngineError::validation(
                "page and page_size must both be at least 1",
            ));
        }
        let needle = filter.name.as_deref().map(str::to_lowercase);
        let mut matches: Vec<SearchItem> = self
            .inner
            .records
            .all()
            .into_iter()
            .rev()
            .filter(|i| i.status != InstallStatus::Deleted)
            .filter(|i| {
                needle
                    .as_deref()
                    .is_none_or(|n| i.name.to_lowercase().contains(n))
            })
            .filter(|i| filter.app_key.as_deref().is_none_or(|k| i.app_key == k))
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .map(|i| SearchItem {
                can_update: self.can_update(&i),
                websites: self
                    .inner
                    .deps
                    .dependents_of_kind(i.id, &ResourceKind::Website),
                summary: i.summary(),
            })
            .filter(|item| !filter.has_update || item.can_update)
            .collect();

        let total = matches.len();
        if !all {
            let start = (page.page - 1).saturating_mul(page.page_size);
            matches = matches
                .into_iter()
                .skip(start)
                .take(page.page_size)
                .collect();
        }
        Ok(SearchPage {
            items: matches,
            total,
        })
    }

    /// Whether an install exists. Never fails on a miss.
    pub fn check_exist(&self, name: &str, app_key: &str) -> ExistCheck {
        let install = self.find(app_key, name).map(|i| i.summary());
        ExistCheck {
            exists: install.is_some(),
            install,
        }
    }

    /// Externally reachable (primary) port of an install.
    pub fn load_port(&self, app_key: &str, name: &str) -> Result<u16> {
        let install = self.find_required(app_key, name)?;
        install
            .primary_port()
            .map(|p| p.host_port)
            .ok_or_else(|| {
                EngineError::not_found(format!("published port of install '{}'", install.name))
            })
    }

    pub fn load_conn_info(&self, app_key: &str, name: &str) -> Result<ConnInfo> {
        let install = self.find_required(app_key, name)?;
        let template = self.inner.catalog.template(&install.app_key)?;
        let service = install.primary_service().ok_or_else(|| {
            EngineError::not_found(format!("services of install '{}'", install.name))
        })?;
        let credential = |key: Option<&str>| {
            key.and_then(|k| install.params.get(k))
                .map(params::value_to_string)
        };
        let (username, password) = match &template.credentials {
            Some(keys) => (
                credential(keys.username.as_deref()),
                credential(Some(keys.password.as_str())),
            ),
            None => (None, None),
        };
        let primary = install.primary_port();
        Ok(ConnInfo {
            status: install.status,
            container_name: service.container_name.clone(),
            service_name: service.name.clone(),
            host: self.inner.host.clone(),
            port: primary.map(|p| p.host_port),
            container_port: primary.map(|p| p.container_port),
            username,
            password,
        })
    }

    /// Installs of `app_key` that other resources can connect to.
    pub fn get_services(&self, app_key: &str) -> Result<Vec<ServiceDescriptor>> {
        self.inner.catalog.template(app_key)?;
        Ok(self
            .inner
            .records
            .all()
            .into_iter()
            .filter(|i| i.app_key == app_key && i.status != InstallStatus::Deleted)
            .filter_map(|i| {
                let primary = i.primary_service()?.clone();
                Some(ServiceDescriptor {
                    label: i.name.clone(),
                    value: primary.name,
                    container_name: primary.container_name,
                    status: i.status,
                    params: i.params,
                })
            })
            .collect())
    }

    /// Service layout of a template.
    pub fn template_services(&self, app_key: &str) -> Result<Vec<ServiceInfo>> {
        Ok(self.inner.catalog.template(app_key)?.service_infos())
    }

    /// Config content as rendered when the install was created.
    pub fn get_default_config(&self, app_key: &str, name: &str) -> Result<String> {
        Ok(self.find_required(app_key, name)?.default_config)
    }

    pub fn get_params(&self, id: InstallId) -> Result<AppConfig> {
        let install = self.get(id)?;
        let fields = self
            .inner
            .catalog
            .get(&install.app_key)
            .map(|t| t.params.clone())
            .unwrap_or_default();
        Ok(AppConfig {
            params: install.params,
            rendered_config: install.rendered_config,
            fields,
        })
    }

    pub fn get_update_versions(&self, id: InstallId) -> Result<Vec<String>> {
        let install = self.get(id)?;
        let template = self.inner.catalog.template(&install.app_key)?;
        Ok(UpgradeResolver::new(template).update_versions(&install))
    }

    /// Every newer version, including ones the install cannot reach directly.
    pub fn upgrade_candidates(&self, id: InstallId) -> Result<Vec<UpgradeCandidate>> {
        let install = self.get(id)?;
        let template = self.inner.catalog.template(&install.app_key)?;
        Ok(UpgradeResolver::new(template).candidates(&install))
    }

    /// Resources that block deleting `id`. Empty means it can go.
    pub fn delete_check(&self, id: InstallId) -> Result<Vec<ResourceRef>> {
        self.get(id)?;
        Ok(self.inner.deps.delete_check(id))
    }

    // -- install lifecycle -----------------------------------------------

    /// Record a new install and reserve its ports. The install stays
    /// `Installing` until [`InstallRegistry::complete_install`].
    pub fn register(&self, actor: &str, new: NewInstall) -> Result<Install> {
        let result = self.register_inner(new.clone());
        let target = result.as_ref().ok().map(Install::label);
        self.audit(
            AuditRecord::new(actor, "register", target)
                .after("app", &new.app_key)
                .after("name", &new.name)
                .after("version", &new.version)
                .outcome(&result),
        );
        result
    }

    fn register_inner(&self, new: NewInstall) -> Result<Install> {
        let template = self.inner.catalog.template(&new.app_key)?;
        if !valid_name(&new.name) {
            return Err(EngineError::validation(format!(
                "install name '{}' must be 1-64 letters, digits, '-' or '_'",
                new.name
            )));
        }
        if !template.versions.is_empty() && !template.has_version(&new.version) {
            return Err(EngineError::not_found(format!(
                "version {} of app '{}'",
                new.version, new.app_key
            )));
        }
        let params = params::apply_defaults(&template.params, &new.params);
        params::validate_params(&template.params, &params)?;
        let rendered = params::render_config(template, &params, &new.version)?;
        let ports = port_bindings(template, &params)?;
        let services = service_records(template, &new.name);

        let _guard = self
            .inner
            .register_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self
            .inner
            .records
            .find(|i| i.app_key == new.app_key && i.name == new.name)
            .is_some()
        {
            return Err(EngineError::NameTaken {
                app_key: new.app_key,
                name: new.name,
            });
        }

        let id = self.inner.records.allocate_id()?;
        self.inner.ports.reserve_all(id, &ports)?;

        let now = chrono::Utc::now();
        let install = Install {
            id,
            app_key: new.app_key,
            version: new.version,
            name: new.name,
            status: InstallStatus::Installing,
            services,
            ports,
            params,
            rendered_config: rendered.clone(),
            default_config: rendered,
            created_at: now,
            updated_at: now,
            ignored_versions: Default::default(),
            error_reason: None,
            pending_upgrade: None,
            redeploy_pending: false,
        };
        if let Err(e) = self.inner.records.commit(&install) {
            self.inner.ports.release_all(id);
            return Err(e);
        }
        info!(install = id, app = %install.app_key, name = %install.name, "install registered");
        Ok(install)
    }

    /// Finish an install started with [`InstallRegistry::register`].
    pub async fn complete_install(
        &self,
        actor: &str,
        id: InstallId,
        failure: Option<String>,
    ) -> Result<Install> {
        let _lock = self.inner.locks.acquire(id).await;
        let result = (|| -> Result<Install> {
            let mut install = self.get(id)?;
            if install.status != InstallStatus::Installing {
                return Err(EngineError::InvalidTransition {
                    install: id,
                    from: install.status,
                    action: "complete install".to_string(),
                });
            }
            match &failure {
                None => install.set_status(InstallStatus::Running, None),
                Some(detail) => install.set_status(
                    InstallStatus::Error,
                    Some(ErrorReason::RuntimeFailure {
                        detail: detail.clone(),
                    }),
                ),
            }
            self.inner.records.commit(&install)?;
            Ok(install)
        })();
        let mut record = AuditRecord::new(actor, "complete_install", self.describe(id).ok())
            .before("status", InstallStatus::Installing);
        if let Ok(install) = &result {
            record = record.after("status", install.status);
        }
        self.audit(record.outcome(&result));
        result
    }

    /// Run a lifecycle action. The work runs as a tracked task, so the
    /// install never stops halfway because a caller went away.
    pub async fn operate(&self, actor: &str, req: OperateRequest) -> Result<Install> {
        let actor = actor.to_string();
        self.run_tracked(move |registry| async move {
            let id = req.install_id;
            let _lock = registry.inner.locks.acquire(id).await;
            let install = registry.get(id)?;
            let label = install.label();
            let (before_status, before_version) = (install.status, install.version.clone());

            let result = async {
                let target = match req.action {
                    Action::Upgrade => {
                        let template = registry.inner.catalog.template(&install.app_key)?;
                        Some(
                            UpgradeResolver::new(template)
                                .resolve_target(&install, req.version.as_deref())?,
                        )
                    }
                    _ => None,
                };
                registry
                    .inner
                    .machine
                    .operate(install, req.action, target)
                    .await
            }
            .await;

            let mut record = AuditRecord::new(&actor, req.action.to_string(), Some(label))
                .before("status", before_status)
                .before("version", &before_version);
            let after = registry.get(id).ok();
            if let Some(after) = &after {
                record = record
                    .after("status", after.status)
                    .after("version", &after.version);
            }
            registry.audit(record.outcome(&result));
            result
        })
        .await
    }

    /// Delete an install that nothing depends on.
    pub async fn delete(&self, actor: &str, id: InstallId, force: bool) -> Result<()> {
        let actor = actor.to_string();
        self.run_tracked(move |registry| async move {
            let lock = registry.inner.locks.acquire(id).await;
            let install = registry.get(id)?;
            let label = install.label();
            let before_status = install.status;

            let result = async {
                let dependents = registry.inner.deps.delete_check(id);
                if !dependents.is_empty() {
                    return Err(EngineError::HasDependents {
                        install: id,
                        resources: dependents,
                    });
                }
                registry.inner.machine.delete(install, force).await
            }
            .await;

            if result.is_ok() {
                registry.inner.deps.forget(id);
                registry.inner.sync.forget(id);
                drop(lock);
                registry.inner.locks.forget(id);
            }
            let mut record = AuditRecord::new(&actor, "delete", Some(label))
                .before("status", before_status)
                .after("force", force);
            if result.is_ok() {
                record = record.after("status", InstallStatus::Deleted);
            }
            registry.audit(record.outcome(&result));
            result
        })
        .await
    }

    // -- parameters and upgrades ----------------------------------------

    /// Replace the install's parameters and re-render its config.
    pub async fn update_params(
        &self,
        actor: &str,
        id: InstallId,
        new_params: Params,
    ) -> Result<UpdateOutcome> {
        let _lock = self.inner.locks.acquire(id).await;
        let install = self.get(id)?;
        let result = self.update_params_locked(install.clone(), new_params);
        let mut record = AuditRecord::new(actor, "update_params", Some(install.label()));
        if let Ok(outcome) = &result {
            record = record.after("changed", outcome.changed_keys.join(","));
        }
        self.audit(record.outcome(&result));
        result
    }

    fn update_params_locked(&self, mut install: Install, new_params: Params) -> Result<UpdateOutcome> {
        if install.status.is_transitional() || install.status == InstallStatus::Deleted {
            return Err(EngineError::InvalidTransition {
                install: install.id,
                from: install.status,
                action: "update params".to_string(),
            });
        }
        let template = self.inner.catalog.template(&install.app_key)?;
        params::validate_update(&template.params, &install.params, &new_params)?;
        let rendered = params::render_config(template, &new_params, &install.version)?;
        let changed_keys = params::changed_keys(&install.params, &new_params);

        // Containers only pick up new values when they are recreated.
        let deployed = build_deployment(&install, template, &install.version).ok();
        install.params = new_params;
        install.rendered_config = rendered;
        let stale = deployed.as_ref()
            != Some(&build_deployment(&install, template, &install.version)?);
        install.redeploy_pending |= stale;
        let restart_required = install.status == InstallStatus::Running && stale;
        install.updated_at = chrono::Utc::now();
        self.inner.records.commit(&install)?;
        Ok(UpdateOutcome {
            changed_keys,
            restart_required,
        })
    }

    /// Hide `version` from the install's upgrade offers.
    pub async fn ignore_upgrade(&self, actor: &str, id: InstallId, version: &str) -> Result<()> {
        let _lock = self.inner.locks.acquire(id).await;
        let result = (|| -> Result<()> {
            let mut install = self.get(id)?;
            let template = self.inner.catalog.template(&install.app_key)?;
            if UpgradeResolver::new(template).ignore(&mut install, version)? {
                install.updated_at = chrono::Utc::now();
                self.inner.records.commit(&install)?;
            }
            Ok(())
        })();
        self.audit(
            AuditRecord::new(actor, "ignore_upgrade", self.describe(id).ok())
                .after("ignored_version", version)
                .outcome(&result),
        );
        result
    }

    // -- ports ------------------------------------------------------------

    /// Move a published port. The new port is reserved before the old one is
    /// released, so neither is ever free mid-swap.
    pub async fn change_port(&self, actor: &str, req: ChangePortRequest) -> Result<()> {
        let actor = actor.to_string();
        self.run_tracked(move |registry| async move {
            let install = registry.find_required(&req.app_key, &req.name)?;
            let _lock = registry.inner.locks.acquire(install.id).await;
            let install = registry.get(install.id)?;
            let label = install.label();

            let before = match &req.service {
                Some(service) => install.port_for(service),
                None => install.primary_port(),
            }
            .map(|b| b.host_port);

            let result = registry.change_port_locked(install, &req).await;
            let mut record = AuditRecord::new(&actor, "change_port", Some(label))
                .after("port", req.port);
            if let Some(before) = before {
                record = record.before("port", before);
            }
            registry.audit(record.outcome(&result));
            result
        })
        .await
    }

    async fn change_port_locked(&self, install: Install, req: &ChangePortRequest) -> Result<()> {
        if req.port == 0 {
            return Err(EngineError::validation("port must be between 1 and 65535"));
        }
        if install.status.is_transitional() || install.status == InstallStatus::Deleted {
            return Err(EngineError::InvalidTransition {
                install: install.id,
                from: install.status,
                action: "change port".to_string(),
            });
        }
        let index = match &req.service {
            Some(service) => install.ports.iter().position(|p| &p.service == service),
            None => (!install.ports.is_empty()).then_some(0),
        }
        .ok_or_else(|| {
            EngineError::not_found(format!("published port of install '{}'", install.name))
        })?;
        let old = install.ports[index].clone();
        if old.host_port == req.port {
            return Ok(());
        }

        let ports = &self.inner.ports;
        ports.reserve(
            req.port,
            old.protocol,
            PortOwner::Install {
                id: install.id,
                service: old.service.clone(),
            },
        )?;

        let mut moved = install.clone();
        moved.ports[index].host_port = req.port;
        if let Some(param) = &old.param {
            moved
                .params
                .insert(param.clone(), serde_json::Value::from(req.port));
            let rendered = self
                .inner
                .catalog
                .template(&moved.app_key)
                .and_then(|t| params::render_config(t, &moved.params, &moved.version));
            match rendered {
                Ok(rendered) => moved.rendered_config = rendered,
                Err(e) => {
                    ports.release(req.port, old.protocol, install.id);
                    return Err(e);
                }
            }
        }
        moved.updated_at = chrono::Utc::now();
        // Remapping recreates the containers from the current parameters.
        moved.redeploy_pending = false;

        if let Err(e) = self.inner.machine.remap_ports(&moved).await {
            ports.release(req.port, old.protocol, install.id);
            return Err(e);
        }

        if let Err(e) = self.inner.records.commit(&moved) {
            if let Err(undo) = self.inner.machine.remap_ports(&install).await {
                tracing::warn!(
                    install = install.id,
                    error = %undo,
                    "could not restore previous port mapping"
                );
            }
            ports.release(req.port, old.protocol, install.id);
            return Err(e);
        }

        ports.release(old.host_port, old.protocol, install.id);
        info!(
            install = install.id,
            app = %install.app_key,
            from = old.host_port,
            to = req.port,
            "port changed"
        );
        Ok(())
    }

    // -- dependencies -----------------------------------------------------

    /// Record that `resource` uses `install_id`. Returns `false` if the
    /// binding already existed.
    pub fn bind_dependency(
        &self,
        actor: &str,
        install_id: InstallId,
        resource: ResourceRef,
    ) -> Result<bool> {
        let result = (|| -> Result<bool> {
            self.get(install_id)?;
            let previous = self.inner.deps.owner_of(&resource);
            if previous == Some(install_id) {
                return Ok(false);
            }
            let record = DependencyRecord {
                resource: resource.clone(),
                install_id,
            };
            self.inner
                .records
                .store()
                .put_dependency(&record)
                .map_err(EngineError::store)?;
            if previous.is_some() {
                self.inner.deps.unbind(&resource);
            }
            self.inner.deps.bind(&record);
            Ok(true)
        })();
        self.audit(
            AuditRecord::new(actor, "bind_dependency", self.describe(install_id).ok())
                .after("resource", &resource)
                .outcome(&result),
        );
        result
    }

    /// Remove the binding of `resource`, wherever it points. Returns the
    /// install it was bound to.
    pub fn unbind_dependency(&self, actor: &str, resource: &ResourceRef) -> Result<Option<InstallId>> {
        let result = (|| -> Result<Option<InstallId>> {
            let Some(install_id) = self.inner.deps.owner_of(resource) else {
                return Ok(None);
            };
            self.inner
                .records
                .store()
                .remove_dependency(&DependencyRecord {
                    resource: resource.clone(),
                    install_id,
                })
                .map_err(EngineError::store)?;
            Ok(self.inner.deps.unbind(resource))
        })();
        let target = result
            .as_ref()
            .ok()
            .copied()
            .flatten()
            .and_then(|id| self.describe(id).ok());
        self.audit(
            AuditRecord::new(actor, "unbind_dependency", target)
                .before("resource", resource)
                .outcome(&result),
        );
        result
    }

    // -- reconciliation ---------------------------------------------------

    /// On-demand reconciliation, honouring the debounce window.
    pub async fn sync_installed(&self) -> SyncReport {
        self.sync_all(false).await
    }

    pub async fn sync_all(&self, force: bool) -> SyncReport {
        self.inner.sync.sync_all(force).await
    }
}
