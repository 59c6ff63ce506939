use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;

use crate::catalog::Catalog;
use crate::config;
use crate::config::resolve::{resolve_config, CONFIG_FILE};
use crate::config::validate::{validate, ConfigDiagnostic};

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| CONFIG_FILE.to_string())
}

/// Print every diagnostic as a miette report on stderr.
pub fn report(errors: Vec<ConfigDiagnostic>) {
    for err in errors {
        let report: miette::Report = err.into();
        eprintln!("{:?}", report);
    }
}

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let Some(config_path) = resolve_config(config_file)? else {
        println!("  No {} found; built-in defaults apply.", CONFIG_FILE);
        return Ok(());
    };

    let (loaded, source) = config::load_config(&config_path)?;
    let filename = display_name(&config_path);

    match validate(&loaded.config, &source, &filename) {
        Ok(()) => {
            let catalog_path = loaded.catalog_path();
            let catalog = Catalog::load(&catalog_path)
                .with_context(|| format!("{} is valid but its catalog is not", filename))?;
            println!(
                "  {} {} is valid ({} apps, {} reserved ports)",
                "\u{2713}".green(),
                filename,
                catalog.len(),
                loaded.config.ports.reserved.len(),
            );
            Ok(())
        }
        Err(errors) => {
            report(errors);
            std::process::exit(1);
        }
    }
}
