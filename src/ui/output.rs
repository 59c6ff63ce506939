use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use serde::Serialize;

use crate::catalog::ServiceInfo;
use crate::cli::Format;
use crate::engine::model::{Install, InstallStatus, InstalledSummary, PortBinding, ResourceRef};
use crate::engine::params::AppConfig;
use crate::engine::registry::{ConnInfo, SearchPage, ServiceDescriptor};
use crate::engine::sync::SyncReport;
use crate::engine::upgrade::UpgradeCandidate;

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn new_table(headers: &[(&str, CellAlignment)]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|(h, align)| Cell::new(h).set_alignment(*align))
            .collect::<Vec<_>>(),
    );
    table
}

fn print_table(table: &Table) {
    // Indent the table by 2 spaces
    for line in table.to_string().lines() {
        println!("  {}", line);
    }
}

fn status_text(status: InstallStatus, use_color: bool) -> String {
    if !use_color {
        return format!("\u{25cf} {}", status);
    }
    let label = status.to_string();
    match status {
        InstallStatus::Running => format!("{} {}", "\u{25cf}".green(), label.green()),
        InstallStatus::Stopped => format!("{} {}", "\u{25cf}".dimmed(), label.dimmed()),
        InstallStatus::Error => format!("{} {}", "\u{25cf}".red(), label.red()),
        InstallStatus::Deleted => format!("\u{25cf} {}", label),
        _ => format!("{} {}", "\u{25cf}".yellow(), label.yellow()),
    }
}

fn ports_text(ports: &[PortBinding]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|p| format!("{}->{}/{}", p.host_port, p.container_port, p.protocol))
        .collect::<Vec<_>>()
        .join(", ")
}

fn heading(text: &str, use_color: bool) {
    if use_color {
        println!("  {}", text.bold());
    } else {
        println!("  {}", text);
    }
}

// -----------------------------------------------------------------------
// Installs
// -----------------------------------------------------------------------

pub fn print_installs(installs: &[InstalledSummary], format: Format) {
    match format {
        Format::Json => print_json(installs),
        Format::Table => print_installs_table(installs, None),
    }
}

fn print_installs_table(installs: &[InstalledSummary], updates: Option<&[bool]>) {
    if installs.is_empty() {
        println!("  No installs found.");
        return;
    }

    let use_color = std::io::stdout().is_terminal();
    let mut headers = vec![
        ("ID", CellAlignment::Right),
        ("Name", CellAlignment::Left),
        ("App", CellAlignment::Left),
        ("Version", CellAlignment::Left),
        ("Ports", CellAlignment::Left),
        ("Status", CellAlignment::Center),
    ];
    if updates.is_some() {
        headers.push(("Update", CellAlignment::Center));
    }
    let mut table = new_table(&headers);

    for (i, install) in installs.iter().enumerate() {
        let mut status = status_text(install.status, use_color);
        if let Some(reason) = &install.error_reason {
            status.push_str(&format!(" ({})", reason));
        }
        let mut row = vec![
            Cell::new(install.id),
            Cell::new(&install.name),
            Cell::new(&install.app_key),
            Cell::new(&install.version),
            Cell::new(ports_text(&install.ports)),
            Cell::new(status),
        ];
        if let Some(updates) = updates {
            let mark = if updates.get(i).copied().unwrap_or(false) {
                "\u{2191}"
            } else {
                ""
            };
            row.push(Cell::new(mark));
        }
        table.add_row(row);
    }
    print_table(&table);
}

pub fn print_search(page: &SearchPage, format: Format) {
    match format {
        Format::Json => print_json(page),
        Format::Table => {
            let summaries: Vec<InstalledSummary> =
                page.items.iter().map(|i| i.summary.clone()).collect();
            let updates: Vec<bool> = page.items.iter().map(|i| i.can_update).collect();
            print_installs_table(&summaries, Some(&updates));
            println!("  {} of {} installs", page.items.len(), page.total);
        }
    }
}

pub fn print_install(install: &Install, format: Format) {
    if format == Format::Json {
        print_json(install);
        return;
    }
    let use_color = std::io::stdout().is_terminal();
    println!();
    heading(&format!("{} ({} {})", install.name, install.app_key, install.version), use_color);
    println!("    ID:       {}", install.id);
    println!("    Status:   {}", status_text(install.status, use_color));
    if let Some(reason) = &install.error_reason {
        println!("    Reason:   {}", reason);
    }
    if let Some(pending) = &install.pending_upgrade {
        println!(
            "    Upgrade:  {} -> {}",
            pending.from_version, pending.to_version
        );
    }
    println!("    Ports:    {}", ports_text(&install.ports));
    println!(
        "    Created:  {}",
        install.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if !install.ignored_versions.is_empty() {
        let ignored: Vec<&str> = install.ignored_versions.iter().map(String::as_str).collect();
        println!("    Ignoring: {}", ignored.join(", "));
    }
    println!("    Containers:");
    for service in &install.services {
        println!("      {:<12} {}", service.name, service.container_name);
    }
    println!();
}

// -----------------------------------------------------------------------
// Connection and services
// -----------------------------------------------------------------------

pub fn print_conn(info: &ConnInfo, format: Format) {
    if format == Format::Json {
        print_json(info);
        return;
    }
    let use_color = std::io::stdout().is_terminal();
    println!("    Status:    {}", status_text(info.status, use_color));
    println!("    Service:   {} ({})", info.service_name, info.container_name);
    println!("    Host:      {}", info.host);
    let port = info
        .port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("    Port:      {}", port);
    if let Some(username) = &info.username {
        println!("    Username:  {}", username);
    }
    if let Some(password) = &info.password {
        println!("    Password:  {}", password);
    }
}

pub fn print_services(services: &[ServiceDescriptor], format: Format) {
    if format == Format::Json {
        print_json(services);
        return;
    }
    if services.is_empty() {
        println!("  No installs of this app.");
        return;
    }
    let use_color = std::io::stdout().is_terminal();
    let mut table = new_table(&[
        ("Install", CellAlignment::Left),
        ("Service", CellAlignment::Left),
        ("Container", CellAlignment::Left),
        ("Status", CellAlignment::Center),
    ]);
    for svc in services {
        table.add_row(vec![
            Cell::new(&svc.label),
            Cell::new(&svc.value),
            Cell::new(&svc.container_name),
            Cell::new(status_text(svc.status, use_color)),
        ]);
    }
    print_table(&table);
}

pub fn print_template_services(services: &[ServiceInfo], format: Format) {
    if format == Format::Json {
        print_json(services);
        return;
    }
    let mut table = new_table(&[
        ("Service", CellAlignment::Left),
        ("Image", CellAlignment::Left),
        ("Ports", CellAlignment::Left),
    ]);
    for svc in services {
        let ports = svc
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(&svc.name),
            Cell::new(&svc.image),
            Cell::new(ports),
        ]);
    }
    print_table(&table);
}

// -----------------------------------------------------------------------
// Upgrades, params, dependencies, sync
// -----------------------------------------------------------------------

pub fn print_versions(versions: &[String], format: Format) {
    match format {
        Format::Json => print_json(versions),
        Format::Table if versions.is_empty() => println!("  Up to date."),
        Format::Table => {
            for v in versions {
                println!("  {}", v);
            }
        }
    }
}

pub fn print_candidates(candidates: &[UpgradeCandidate], format: Format) {
    if format == Format::Json {
        print_json(candidates);
        return;
    }
    if candidates.is_empty() {
        println!("  Up to date.");
        return;
    }
    let mut table = new_table(&[
        ("Current", CellAlignment::Left),
        ("Available", CellAlignment::Left),
        ("Compatible", CellAlignment::Center),
    ]);
    for c in candidates {
        table.add_row(vec![
            Cell::new(&c.current_version),
            Cell::new(&c.available_version),
            Cell::new(if c.compatible { "yes" } else { "no" }),
        ]);
    }
    print_table(&table);
}

pub fn print_params(config: &AppConfig, format: Format) {
    if format == Format::Json {
        print_json(config);
        return;
    }
    let use_color = std::io::stdout().is_terminal();
    heading("Parameters", use_color);
    for (key, value) in &config.params {
        let editable = config
            .fields
            .iter()
            .find(|f| &f.key == key)
            .map(|f| f.editable)
            .unwrap_or(true);
        let lock = if editable { "" } else { " (read-only)" };
        println!("    {:<20} {}{}", key, value, lock);
    }
    println!();
    heading("Rendered config", use_color);
    for line in config.rendered_config.lines() {
        println!("    {}", line);
    }
}

pub fn print_resources(resources: &[ResourceRef], format: Format) {
    match format {
        Format::Json => print_json(resources),
        Format::Table if resources.is_empty() => println!("  Nothing depends on this install."),
        Format::Table => {
            println!("  Blocked by:");
            for r in resources {
                println!("    - {}", r);
            }
        }
    }
}

pub fn print_sync_report(report: &SyncReport, format: Format) {
    if format == Format::Json {
        print_json(report);
        return;
    }
    if report.sweep_skipped {
        println!("  Another sync is already running.");
        return;
    }
    println!(
        "  Checked {}, skipped {}, corrected {}",
        report.checked, report.skipped, report.corrected
    );
    if report.discrepancies.is_empty() {
        return;
    }
    let mut table = new_table(&[
        ("Install", CellAlignment::Left),
        ("Recorded", CellAlignment::Left),
        ("Observed", CellAlignment::Left),
        ("Now", CellAlignment::Left),
    ]);
    for d in &report.discrepancies {
        let now = d
            .corrected_to
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(format!("{} ({})", d.name, d.app_key)),
            Cell::new(d.recorded),
            Cell::new(&d.observed),
            Cell::new(now),
        ]);
    }
    print_table(&table);
}
