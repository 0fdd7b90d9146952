use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Default file name looked up by the host.
pub const CONFIG_FILE: &str = "keel.toml";

const DEFAULT_CONTAINER: &str = "keel.app";
const DEFAULT_TICKS: u64 = 3;
const DEFAULT_FILTER: &str = "info";

/// Host configuration loaded from `keel.toml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeelConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// How the host builds and drives its runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    /// Id of the root container modules are registered into.
    #[serde(default = "default_container")]
    pub container: String,
    /// Number of ticks the loop runs when not overridden on the command line.
    #[serde(default = "default_ticks")]
    pub ticks: u64,
    /// Semver requirement on the host version, e.g. `"^0.1"`.
    #[serde(default)]
    pub requires: Option<String>,
    /// Module ids to register; empty means every built-in module.
    #[serde(default)]
    pub modules: Vec<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            container: default_container(),
            ticks: default_ticks(),
            requires: None,
            modules: Vec::new(),
        }
    }
}

/// Where project documents live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    /// Default for `--load` and `--save`.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

/// Logging defaults; `KEEL_LOG` and `KEEL_LOG_DIR` still take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            dir: None,
        }
    }
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

fn default_ticks() -> u64 {
    DEFAULT_TICKS
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

impl KeelConfig {
    /// Parse and validate config TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse keel config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read keel config at {}", path.display()))?;

        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid keel config at {}", path.display()))
    }

    /// Like [`from_path`](Self::from_path), but a missing file yields the
    /// defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::metadata(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            _ => Self::from_path(path),
        }
    }

    /// Validate required fields and semantic constraints.
    pub fn validate(&self) -> Result<()> {
        validate_nonempty("runtime.container", &self.runtime.container)?;
        if self.runtime.container.trim() != self.runtime.container {
            bail!(
                "runtime.container {:?} has leading/trailing whitespace",
                self.runtime.container
            );
        }
        if self.runtime.ticks == 0 {
            bail!("runtime.ticks must be greater than zero");
        }
        if let Some(requires) = &self.runtime.requires {
            VersionReq::parse(requires).with_context(|| {
                format!("runtime.requires must be a valid semver requirement: {requires}")
            })?;
        }
        validate_module_list("runtime.modules", &self.runtime.modules)?;

        if let Some(path) = &self.project.state_file {
            if path.as_os_str().is_empty() {
                bail!("project.state_file must not be empty");
            }
        }
        validate_nonempty("logging.filter", &self.logging.filter)?;

        Ok(())
    }

    /// Ensure the running host satisfies `runtime.requires`.
    pub fn supports_host(&self, host_version: &str) -> Result<()> {
        let Some(requires) = &self.runtime.requires else {
            return Ok(());
        };
        let requirement = VersionReq::parse(requires).with_context(|| {
            format!("runtime.requires must be a valid semver requirement: {requires}")
        })?;
        let host = Version::parse(host_version)
            .with_context(|| format!("host version must be valid semver: {host_version}"))?;

        if requirement.matches(&host) {
            Ok(())
        } else {
            bail!("config requires keel {requires} but host is {host}")
        }
    }

    /// Return true when the module should be registered.
    pub fn module_enabled(&self, id: &str) -> bool {
        self.runtime.modules.is_empty() || self.runtime.modules.iter().any(|m| m == id)
    }
}

fn validate_nonempty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} must not be empty")
    }
    Ok(())
}

fn validate_module_list(field: &str, values: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();

    for value in values {
        if value.trim().is_empty() {
            bail!("{field} entries must not be empty");
        }
        if value.trim() != value {
            bail!("{field} entry {:?} has leading/trailing whitespace", value);
        }
        if !seen.insert(value.as_str()) {
            bail!("{field} contains duplicate entry {:?}", value);
        }
    }

    Ok(())
}
