// The miette/thiserror derive macros generate code that triggers false
// positive unused_assignments warnings on enum variant fields.
#![allow(unused_assignments)]

use std::collections::BTreeMap;

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::model::AppkeeperConfig;
use crate::engine::model::Protocol;

// ---------------------------------------------------------------------------
// ConfigDiagnostic: miette-powered validation error
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigDiagnostic {
    #[error("`{field}` is not a valid duration: {value:?}")]
    #[diagnostic(
        code(appkeeper::invalid_duration),
        help("use a humantime duration such as \"30s\", \"5m\" or \"1h 30m\"")
    )]
    InvalidDuration {
        #[source_code]
        src: NamedSource<String>,
        #[label("cannot parse this duration")]
        span: SourceSpan,
        field: String,
        value: String,
    },

    #[error("`{field}` must be greater than zero")]
    #[diagnostic(code(appkeeper::zero_duration))]
    ZeroDuration {
        #[source_code]
        src: NamedSource<String>,
        #[label("zero is not allowed here")]
        span: SourceSpan,
        field: String,
    },

    #[error("operations.stop_timeout_secs must not be negative, got {value}")]
    #[diagnostic(code(appkeeper::negative_stop_timeout))]
    NegativeStopTimeout {
        #[source_code]
        src: NamedSource<String>,
        #[label("negative timeout")]
        span: SourceSpan,
        value: i32,
    },

    #[error("workers.max_operations must be at least 1")]
    #[diagnostic(
        code(appkeeper::no_workers),
        help("with zero workers no lifecycle operation could ever run")
    )]
    NoWorkers {
        #[source_code]
        src: NamedSource<String>,
        #[label("set to zero")]
        span: SourceSpan,
    },

    #[error("reserved port for `{owner}` is 0")]
    #[diagnostic(code(appkeeper::zero_port))]
    ZeroPort {
        #[source_code]
        src: NamedSource<String>,
        #[label("port must be between 1 and 65535")]
        span: SourceSpan,
        owner: String,
    },

    #[error("reserved port entry {index} has an empty owner")]
    #[diagnostic(code(appkeeper::empty_owner))]
    EmptyOwner {
        #[source_code]
        src: NamedSource<String>,
        #[label("owner is empty")]
        span: SourceSpan,
        index: usize,
    },

    #[error("port {port}/{protocol} is reserved more than once: {owners:?}")]
    #[diagnostic(code(appkeeper::duplicate_reserved_port))]
    DuplicateReservedPort {
        #[source_code]
        src: NamedSource<String>,
        #[label("duplicate reservation")]
        span: SourceSpan,
        port: u16,
        protocol: Protocol,
        owners: Vec<String>,
    },

    #[error("engine.{field} is empty")]
    #[diagnostic(code(appkeeper::empty_path))]
    EmptyPath {
        #[source_code]
        src: NamedSource<String>,
        #[label("path is empty")]
        span: SourceSpan,
        field: String,
    },
}

// ---------------------------------------------------------------------------
// Span helpers
// ---------------------------------------------------------------------------

/// Span of the value of `field` in the `[section]` table, or of the section
/// header when the field is absent (a default was used).
fn find_field_span(source: &str, section: &str, field: &str) -> SourceSpan {
    let header = format!("[{}]", section);
    match source.find(&header) {
        Some(start) => {
            value_span_after(source, start, field).unwrap_or((start, header.len()).into())
        }
        None => (0, 0).into(),
    }
}

/// Span of the value of `field` in the `index`th `[[ports.reserved]]` entry.
fn find_reserved_span(source: &str, index: usize, field: &str) -> SourceSpan {
    let header = "[[ports.reserved]]";
    let Some((start, _)) = source.match_indices(header).nth(index) else {
        return find_field_span(source, "ports", "reserved");
    };
    value_span_after(source, start, field).unwrap_or((start, header.len()).into())
}

/// Find `field = value` after `from`, stopping at the next table header.
fn value_span_after(source: &str, from: usize, field: &str) -> Option<SourceSpan> {
    let mut offset = from;
    for (i, line) in source[from..].split_inclusive('\n').enumerate() {
        let trimmed = line.trim_start();
        if i > 0 && trimmed.starts_with('[') {
            return None;
        }
        if let Some(rest) = trimmed.strip_prefix(field) {
            if rest.trim_start().starts_with('=') {
                let eq = line.find('=')?;
                let after = &line[eq + 1..];
                let lead = after.len() - after.trim_start().len();
                return Some((offset + eq + 1 + lead, after.trim().len()).into());
            }
        }
        offset += line.len();
    }
    None
}

// ---------------------------------------------------------------------------
// Main validation function
// ---------------------------------------------------------------------------

pub fn validate(
    config: &AppkeeperConfig,
    source: &str,
    filename: &str,
) -> Result<(), Vec<ConfigDiagnostic>> {
    let mut errors = Vec::new();
    let src = NamedSource::new(filename, source.to_string());

    for (field, value) in [
        ("state_dir", &config.engine.state_dir),
        ("catalog", &config.engine.catalog),
    ] {
        if value.trim().is_empty() {
            errors.push(ConfigDiagnostic::EmptyPath {
                src: src.clone(),
                span: find_field_span(source, "engine", field),
                field: field.to_string(),
            });
        }
    }

    // (section, field, value, zero allowed)
    let durations = [
        ("sync", "interval", &config.sync.interval, false),
        ("sync", "debounce", &config.sync.debounce, true),
        ("operations", "timeout", &config.operations.timeout, false),
        ("operations", "health_timeout", &config.operations.health_timeout, false),
    ];
    for (section, field, value, zero_ok) in durations {
        match humantime::parse_duration(value) {
            Err(_) => errors.push(ConfigDiagnostic::InvalidDuration {
                src: src.clone(),
                span: find_field_span(source, section, field),
                field: format!("{}.{}", section, field),
                value: value.clone(),
            }),
            Ok(d) if d.is_zero() && !zero_ok => errors.push(ConfigDiagnostic::ZeroDuration {
                src: src.clone(),
                span: find_field_span(source, section, field),
                field: format!("{}.{}", section, field),
            }),
            Ok(_) => {}
        }
    }

    if config.operations.stop_timeout_secs < 0 {
        errors.push(ConfigDiagnostic::NegativeStopTimeout {
            src: src.clone(),
            span: find_field_span(source, "operations", "stop_timeout_secs"),
            value: config.operations.stop_timeout_secs,
        });
    }

    if config.workers.max_operations == 0 {
        errors.push(ConfigDiagnostic::NoWorkers {
            src: src.clone(),
            span: find_field_span(source, "workers", "max_operations"),
        });
    }

    let mut seen: BTreeMap<(u16, Protocol), Vec<(usize, String)>> = BTreeMap::new();
    for (index, reserved) in config.ports.reserved.iter().enumerate() {
        if reserved.owner.trim().is_empty() {
            errors.push(ConfigDiagnostic::EmptyOwner {
                src: src.clone(),
                span: find_reserved_span(source, index, "owner"),
                index,
            });
        }
        if reserved.port == 0 {
            errors.push(ConfigDiagnostic::ZeroPort {
                src: src.clone(),
                span: find_reserved_span(source, index, "port"),
                owner: reserved.owner.clone(),
            });
            continue;
        }
        seen.entry((reserved.port, reserved.protocol))
            .or_default()
            .push((index, reserved.owner.clone()));
    }
    for ((port, protocol), entries) in seen {
        if entries.len() > 1 {
            let (last_index, _) = entries[entries.len() - 1];
            errors.push(ConfigDiagnostic::DuplicateReservedPort {
                src: src.clone(),
                span: find_reserved_span(source, last_index, "port"),
                port,
                protocol,
                owners: entries.into_iter().map(|(_, owner)| owner).collect(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
