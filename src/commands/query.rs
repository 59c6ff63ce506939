use anyhow::Result;
use std::path::Path;

use crate::cli::Format;
use crate::commands::open_engine;
use crate::engine::model::InstallId;
use crate::engine::registry::{PageRequest, SearchFilter};
use crate::ui::output;

pub async fn run_list(config_file: Option<&Path>, format: Format) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    output::print_installs(&engine.registry().list(), format);
    Ok(())
}

pub async fn run_search(
    config_file: Option<&Path>,
    filter: SearchFilter,
    page: PageRequest,
    all: bool,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let page = engine.registry().search(&filter, page, all)?;
    output::print_search(&page, format);
    Ok(())
}

pub async fn run_show(config_file: Option<&Path>, id: InstallId, format: Format) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    output::print_install(&engine.registry().get(id)?, format);
    Ok(())
}

pub async fn run_check(
    config_file: Option<&Path>,
    app_key: &str,
    name: &str,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let check = engine.registry().check_exist(name, app_key);
    match (format, &check.install) {
        (Format::Json, _) => output::print_json(&check),
        (Format::Table, Some(install)) => output::print_installs(&[install.clone()], format),
        (Format::Table, None) => println!("  Not installed."),
    }
    Ok(())
}

pub async fn run_port(
    config_file: Option<&Path>,
    app_key: &str,
    name: &str,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let port = engine.registry().load_port(app_key, name)?;
    match format {
        Format::Json => output::print_json(&port),
        Format::Table => println!("{}", port),
    }
    Ok(())
}

pub async fn run_conn(
    config_file: Option<&Path>,
    app_key: &str,
    name: &str,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    output::print_conn(&engine.registry().load_conn_info(app_key, name)?, format);
    Ok(())
}

pub async fn run_delete_check(
    config_file: Option<&Path>,
    id: InstallId,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    output::print_resources(&engine.registry().delete_check(id)?, format);
    Ok(())
}

pub async fn run_services(
    config_file: Option<&Path>,
    app_key: &str,
    template: bool,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    if template {
        output::print_template_services(&engine.registry().template_services(app_key)?, format);
    } else {
        output::print_services(&engine.registry().get_services(app_key)?, format);
    }
    Ok(())
}

pub async fn run_versions(
    config_file: Option<&Path>,
    id: InstallId,
    all: bool,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    if all {
        output::print_candidates(&engine.registry().upgrade_candidates(id)?, format);
    } else {
        output::print_versions(&engine.registry().get_update_versions(id)?, format);
    }
    Ok(())
}

pub async fn run_default_config(
    config_file: Option<&Path>,
    app_key: &str,
    name: &str,
    format: Format,
) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    let config = engine.registry().get_default_config(app_key, name)?;
    match format {
        Format::Json => output::print_json(&config),
        Format::Table => print!("{}", config),
    }
    Ok(())
}

pub async fn run_params(config_file: Option<&Path>, id: InstallId, format: Format) -> Result<()> {
    let engine = open_engine(config_file, false).await?;
    output::print_params(&engine.registry().get_params(id)?, format);
    Ok(())
}
