//! Network allowlist management.
//!
//! The global allowlist lives at `protected/network.yaml`, outside the
//! agent sandbox so agents cannot tamper with it.  Each entry matches
//! itself exactly or, when it starts with `*.`, any single-label-prefixed
//! subdomain.  A bare `*` is not a wildcard — legacy `["*"]` configs are
//! migrated to the curated default list on load.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::paths;

/// Domains allowed by default so agents can install dependencies and fetch
/// code out of the box.
pub const DEFAULT_DOMAINS: &[&str] = &[
    // Python (pip / uv / poetry)
    "pypi.org",
    "files.pythonhosted.org",
    // Node (npm / yarn / pnpm)
    "registry.npmjs.org",
    "registry.yarnpkg.com",
    // Rust (cargo)
    "crates.io",
    "static.crates.io",
    "index.crates.io",
    // Go
    "proxy.golang.org",
    "sum.golang.org",
    "storage.googleapis.com",
    // Ruby (gem / bundler)
    "rubygems.org",
    "index.rubygems.org",
    // Java / Kotlin (Maven / Gradle)
    "repo1.maven.org",
    "repo.maven.apache.org",
    "plugins.gradle.org",
    "services.gradle.org",
    // .NET (NuGet)
    "api.nuget.org",
    "*.nuget.org",
    // Dart / Flutter (pub)
    "pub.dev",
    "*.pub.dev",
    // PHP (Composer / Packagist)
    "packagist.org",
    "repo.packagist.org",
    // Elixir (Hex)
    "hex.pm",
    "repo.hex.pm",
    "builds.hex.pm",
    // Haskell (Hackage)
    "hackage.haskell.org",
    // Git forges
    "github.com",
    "*.github.com",
    "*.githubusercontent.com",
    "gitlab.com",
    "*.gitlab.com",
    "bitbucket.org",
    "*.bitbucket.org",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "allowedDomains")]
    pub allowed_domains: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowed_domains: DEFAULT_DOMAINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // "example.com", "sub.example.com" or "*.example.com"
        Regex::new(
            r"^(\*\.)?[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$",
        )
        .unwrap_or_else(|e| unreachable!("domain pattern is valid: {e}"))
    })
}

pub fn validate_domain(domain: &str) -> Result<()> {
    if !domain_pattern().is_match(domain) {
        bail!(
            "Invalid domain pattern: '{domain}'. Must be a domain like 'example.com' \
             or a wildcard like '*.example.com'."
        );
    }
    Ok(())
}

/// Whether `domain` matches any allowlist entry.  `*.suffix` matches
/// exactly one extra label; a bare `*` entry matches nothing.
pub fn is_domain_allowed(domain: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        if let Some(suffix) = entry.strip_prefix("*.") {
            domain
                .strip_suffix(suffix)
                .and_then(|head| head.strip_suffix('.'))
                .map(|label| !label.is_empty() && !label.contains('.'))
                .unwrap_or(false)
        } else {
            entry != "*" && domain == entry
        }
    })
}

pub fn load_config(home: &Path) -> NetworkConfig {
    let path = paths::network_config_path(home);
    if !path.exists() {
        return NetworkConfig::default();
    }
    let config = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_yaml::from_str::<NetworkConfig>(&raw).ok());
    let Some(mut config) = config else {
        warn!("corrupt network.yaml — returning defaults");
        return NetworkConfig::default();
    };
    // Legacy wildcard-only configs migrate to the curated default list;
    // a bare "*" never matched anything.
    if config.allowed_domains == ["*"] {
        info!("migrating legacy network.yaml wildcard to default domain list");
        config = NetworkConfig::default();
        if let Err(e) = save_config(home, &config) {
            warn!("failed to persist migrated network.yaml: {e}");
        }
    }
    config
}

pub fn save_config(home: &Path, config: &NetworkConfig) -> Result<()> {
    let path = paths::network_config_path(home);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_yaml::to_string(config).context("serialize network.yaml")?;
    std::fs::write(&path, raw).with_context(|| format!("write {path:?}"))?;
    Ok(())
}

pub fn get_allowed_domains(home: &Path) -> Vec<String> {
    load_config(home).allowed_domains
}

/// Add a domain.  Returns the updated list; adding a present domain is a
/// no-op.
pub fn allow_domain(home: &Path, domain: &str) -> Result<Vec<String>> {
    validate_domain(domain)?;
    let mut config = load_config(home);
    if !config.allowed_domains.iter().any(|d| d == domain) {
        config.allowed_domains.push(domain.to_string());
        save_config(home, &config)?;
    }
    Ok(config.allowed_domains)
}

pub fn disallow_domain(home: &Path, domain: &str) -> Result<Vec<String>> {
    validate_domain(domain)?;
    let mut config = load_config(home);
    let before = config.allowed_domains.len();
    config.allowed_domains.retain(|d| d != domain);
    if config.allowed_domains.len() == before {
        bail!("Domain '{domain}' is not in the allowlist.");
    }
    save_config(home, &config)?;
    Ok(config.allowed_domains)
}

pub fn reset_config(home: &Path) -> Result<Vec<String>> {
    let config = NetworkConfig::default();
    save_config(home, &config)?;
    Ok(config.allowed_domains)
}
