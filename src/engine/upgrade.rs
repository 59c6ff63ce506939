use semver::Version;
use serde::Serialize;

use crate::catalog::AppTemplate;
use crate::engine::model::Install;
use crate::error::{EngineError, Result};

/// Parse a catalog version string leniently.
///
/// A leading `v` is ignored and missing minor/patch components are filled with
/// zero, so `8.0` becomes `8.0.0` and `2.0-rc1` becomes `2.0.0-rc1`. Strings
/// such as `latest` return `None`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(split_at);
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// A catalog version the install could move to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeCandidate {
    pub current_version: String,
    pub available_version: String,
    /// `false` when the target requires a newer starting version.
    pub compatible: bool,
}

/// Computes upgrade targets for installs of one template.
pub struct UpgradeResolver<'a> {
    template: &'a AppTemplate,
}

impl<'a> UpgradeResolver<'a> {
    pub fn new(template: &'a AppTemplate) -> Self {
        Self { template }
    }

    /// Versions newer than the install's, excluding ignored ones, oldest first.
    pub fn candidates(&self, install: &Install) -> Vec<UpgradeCandidate> {
        let Some(current) = parse_version(&install.version) else {
            tracing::debug!(
                install = install.id,
                version = %install.version,
                "current version is not comparable, no upgrades offered"
            );
            return Vec::new();
        };

        let mut newer: Vec<(Version, UpgradeCandidate)> = self
            .template
            .versions
            .iter()
            .filter(|v| !install.ignored_versions.contains(&v.version))
            .filter_map(|v| {
                let parsed = parse_version(&v.version)?;
                if parsed <= current {
                    return None;
                }
                let compatible = v
                    .min_upgrade_from
                    .as_deref()
                    .and_then(parse_version)
                    .is_none_or(|min| current >= min);
                Some((
                    parsed,
                    UpgradeCandidate {
                        current_version: install.version.clone(),
                        available_version: v.version.clone(),
                        compatible,
                    },
                ))
            })
            .collect();
        newer.sort_by(|a, b| a.0.cmp_precedence(&b.0));
        newer.dedup_by(|a, b| a.0.cmp_precedence(&b.0).is_eq());
        newer.into_iter().map(|(_, c)| c).collect()
    }

    /// Reachable upgrade targets, oldest first.
    pub fn update_versions(&self, install: &Install) -> Vec<String> {
        self.candidates(install)
            .into_iter()
            .filter(|c| c.compatible)
            .map(|c| c.available_version)
            .collect()
    }

    /// Pick the version an upgrade should move to. Without an explicit request
    /// the newest reachable release is used, or the newest reachable
    /// pre-release when no release is reachable.
    pub fn resolve_target(&self, install: &Install, requested: Option<&str>) -> Result<String> {
        let candidates = self.candidates(install);
        match requested {
            None => {
                let reachable: Vec<String> = candidates
                    .into_iter()
                    .filter(|c| c.compatible)
                    .map(|c| c.available_version)
                    .collect();
                let is_release = |v: &&String| parse_version(v).is_some_and(|p| p.pre.is_empty());
                reachable
                    .iter()
                    .rfind(is_release)
                    .or(reachable.last())
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::validation(format!(
                            "install {} is already on the newest reachable version {}",
                            install.id, install.version
                        ))
                    })
            }
            Some(version) => {
                if !self.template.has_version(version) {
                    return Err(EngineError::not_found(format!(
                        "version {version} of app '{}'",
                        self.template.key
                    )));
                }
                // Explicit requests may target an ignored version.
                let target = parse_version(version).ok_or_else(|| {
                    EngineError::validation(format!("version '{version}' is not comparable"))
                })?;
                let current = parse_version(&install.version).ok_or_else(|| {
                    EngineError::validation(format!(
                        "current version '{}' is not comparable",
                        install.version
                    ))
                })?;
                if target <= current {
                    return Err(EngineError::validation(format!(
                        "version {version} is not newer than {}",
                        install.version
                    )));
                }
                let min = self
                    .template
                    .version(version)
                    .and_then(|v| v.min_upgrade_from.as_deref())
                    .and_then(parse_version);
                if let Some(min) = min {
                    if current < min {
                        return Err(EngineError::validation(format!(
                            "version {version} requires upgrading from {min} or newer"
                        )));
                    }
                }
                Ok(version.to_string())
            }
        }
    }

    /// Record `version` as ignored for this install. Returns `false` if it was
    /// already ignored.
    pub fn ignore(&self, install: &mut Install, version: &str) -> Result<bool> {
        if !self.template.has_version(version) {
            return Err(EngineError::not_found(format!(
                "version {version} of app '{}'",
                self.template.key
            )));
        }
        Ok(install.ignored_versions.insert(version.to_string()))
    }
}
