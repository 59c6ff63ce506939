use crate::catalog::AppTemplate;
use crate::engine::model::{Install, Params, PortBinding, ServiceRecord};
use crate::engine::params::{self, parse_port_value};
use crate::error::{EngineError, Result};
use crate::runtime::{project_label, Deployment, PortMap, ServiceDeployment, Target};

/// Env var that carries the install's rendered config into every container.
pub const CONFIG_ENV: &str = "APPKEEPER_CONFIG";

/// Docker container name of one service of an install.
pub fn container_name(app_key: &str, install_name: &str, service: &str) -> String {
    format!("ak-{}-{}-{}", app_key, install_name, service)
}

/// Service records in start order.
pub fn service_records(template: &AppTemplate, install_name: &str) -> Vec<ServiceRecord> {
    template
        .ordered_services()
        .map(|(name, _)| ServiceRecord {
            name: name.clone(),
            container_name: container_name(&template.key, install_name, name),
        })
        .collect()
}

/// Host port bindings requested by `params`, in service start order.
///
/// A port with a parameter publishes the parameter's value; one without
/// publishes the container port unchanged.
pub fn port_bindings(template: &AppTemplate, params: &Params) -> Result<Vec<PortBinding>> {
    let mut bindings = Vec::new();
    for (service, svc) in template.ordered_services() {
        for port in &svc.ports {
            let host_port = match &port.param {
                Some(key) => {
                    let value = params.get(key).ok_or_else(|| {
                        EngineError::validation(format!(
                            "parameter '{key}' is required to publish port {} of service '{service}'",
                            port.container_port
                        ))
                    })?;
                    parse_port_value(value).ok_or_else(|| {
                        EngineError::validation(format!(
                            "parameter '{key}' must be a port between 1 and 65535, got {value}"
                        ))
                    })?
                }
                None => port.container_port,
            };
            bindings.push(PortBinding {
                service: service.clone(),
                host_port,
                container_port: port.container_port,
                protocol: port.protocol,
                param: port.param.clone(),
            });
        }
    }
    Ok(bindings)
}

/// Volume name scoped to the install, from a "name:/container/path" spec.
fn scoped_volume(spec: &str, project: &str) -> Result<(String, String)> {
    match spec.split_once(':') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((format!("{}-{}", project, name), path.to_string()))
        }
        _ => Err(EngineError::validation(format!(
            "volume '{spec}' must look like name:/container/path"
        ))),
    }
}

/// Everything the runtime needs to (re)create `install` at `version`.
pub fn build_deployment(
    install: &Install,
    template: &AppTemplate,
    version: &str,
) -> Result<Deployment> {
    let target = Target::for_install(install);
    let project = project_label(install.id);
    let config = params::render_config(template, &install.params, version)?;
    let mut services = Vec::new();
    for record in &install.services {
        let svc = template.services.get(&record.name).ok_or_else(|| {
            EngineError::validation(format!(
                "service '{}' is no longer part of app '{}'",
                record.name, template.key
            ))
        })?;
        let context = format!("services.{}", record.name);
        let image = params::render(&svc.image, &install.params, version, &context)?;
        let mut env = svc
            .env
            .iter()
            .map(|(k, v)| {
                params::render(v, &install.params, version, &format!("{context}.env.{k}"))
                    .map(|v| (k.clone(), v))
            })
            .collect::<Result<Vec<_>>>()?;
        if !config.is_empty() {
            env.push((CONFIG_ENV.to_string(), config.clone()));
        }
        let volumes = svc
            .volumes
            .iter()
            .map(|spec| scoped_volume(spec, &project))
            .collect::<Result<Vec<_>>>()?;
        let ports = install
            .ports
            .iter()
            .filter(|p| p.service == record.name)
            .map(|p| PortMap {
                container_port: p.container_port,
                host_port: p.host_port,
                protocol: p.protocol,
            })
            .collect();
        services.push(ServiceDeployment {
            service: record.name.clone(),
            container_name: record.container_name.clone(),
            image,
            env,
            ports,
            volumes,
        });
    }
    Ok(Deployment { target, services })
}
