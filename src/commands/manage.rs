use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::cli::Format;
use crate::commands::{open_engine, params_from_pairs};
use crate::engine::model::{Action, InstallId, ResourceKind, ResourceRef};
use crate::engine::registry::{ChangePortRequest, NewInstall, OperateRequest};
use crate::ui::output;

fn done(message: &str) {
    println!("  {} {}", "\u{2713}".green(), message);
}

fn resource(kind: &str, id: String, name: Option<String>) -> Result<ResourceRef> {
    let kind = kind.parse::<ResourceKind>().map_err(anyhow::Error::msg)?;
    Ok(ResourceRef { kind, id, name })
}

pub async fn run_sync(config_file: Option<&Path>, force: bool, format: Format) -> Result<()> {
    let engine = open_engine(config_file, true).await?;
    let report = engine.registry().sync_all(force).await;
    output::print_sync_report(&report, format);
    Ok(())
}

pub async fn run_operate(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    action: Action,
    version: Option<String>,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, true).await?;
    let install = engine
        .registry()
        .operate(
            actor,
            OperateRequest {
                install_id: id,
                action,
                version,
            },
        )
        .await?;
    match format {
        Format::Json => output::print_json(&install.summary()),
        Format::Table => done(&format!(
            "{} {} ({}): {}",
            action, install.name, install.version, install.status
        )),
    }
    Ok(())
}

pub async fn run_change_port(
    config_file: Option<&Path>,
    actor: &str,
    req: ChangePortRequest,
) -> Result<()> {
    let engine = open_engine(config_file, true).await?;
    let port = req.port;
    let name = req.name.clone();
    engine.registry().change_port(actor, req).await?;
    done(&format!("{} now listens on {}", name, port));
    Ok(())
}

pub async fn run_set_params(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    values: Vec<(String, String)>,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let registry = engine.registry();
    let mut params = registry.get_params(id)?.params;
    params.extend(params_from_pairs(values));
    let outcome = registry.update_params(actor, id, params).await?;
    match format {
        Format::Json => output::print_json(&outcome),
        Format::Table => {
            if outcome.changed_keys.is_empty() {
                println!("  Nothing changed.");
            } else {
                done(&format!("updated {}", outcome.changed_keys.join(", ")));
            }
            if outcome.restart_required {
                println!(
                    "  Restart the install to apply: appkeeper operate {} restart",
                    id
                );
            }
        }
    }
    Ok(())
}

pub async fn run_ignore_upgrade(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    version: &str,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    engine.registry().ignore_upgrade(actor, id, version).await?;
    done(&format!("version {} will no longer be offered", version));
    Ok(())
}

pub async fn run_delete(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    force: bool,
) -> Result<()> {
    let engine = open_engine(config_file, true).await?;
    engine.registry().delete(actor, id, force).await?;
    done(&format!("install {} deleted", id));
    Ok(())
}

pub async fn run_register(
    config_file: Option<&Path>,
    actor: &str,
    new: NewInstall,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let install = engine.registry().register(actor, new)?;
    match format {
        Format::Json => output::print_json(&install),
        Format::Table => done(&format!(
            "registered {} as install {}",
            install.name, install.id
        )),
    }
    Ok(())
}

pub async fn run_complete(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    failed: Option<String>,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let install = engine.registry().complete_install(actor, id, failed).await?;
    done(&format!("install {} is {}", install.id, install.status));
    Ok(())
}

pub async fn run_bind(
    config_file: Option<&Path>,
    actor: &str,
    id: InstallId,
    kind: &str,
    resource_id: String,
    name: Option<String>,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let resource = resource(kind, resource_id, name)?;
    let label = resource.to_string();
    if engine.registry().bind_dependency(actor, id, resource)? {
        done(&format!("{} now depends on install {}", label, id));
    } else {
        println!("  {} was already bound to install {}", label, id);
    }
    Ok(())
}

pub async fn run_unbind(
    config_file: Option<&Path>,
    actor: &str,
    kind: &str,
    resource_id: String,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let resource = resource(kind, resource_id, None)?;
    match engine.registry().unbind_dependency(actor, &resource)? {
        Some(id) => done(&format!("{} released install {}", resource, id)),
        None => println!("  {} was not bound", resource),
    }
    Ok(())
}
