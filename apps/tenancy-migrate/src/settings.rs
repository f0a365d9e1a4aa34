//! Layered configuration: defaults, then the YAML file, then `TENANCY__*` variables.

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use tenancy_db::config::TenancyConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/tenancy.yaml";
const ENV_PREFIX: &str = "TENANCY__";

/// Load the effective configuration.
///
/// An explicitly requested file must exist; the default path is optional.
pub fn load(explicit: Option<&Path>) -> Result<TenancyConfig> {
    let mut figment = Figment::new().merge(Serialized::defaults(TenancyConfig::default()));
    match explicit {
        Some(path) => {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        None => {
            if Path::new(DEFAULT_CONFIG_PATH).is_file() {
                figment = figment.merge(Yaml::file(DEFAULT_CONFIG_PATH));
            }
        }
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("invalid configuration")
}
