use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use jupytercluster_core::config::{Config, WarnLevel};
use jupytercluster_core::io::write_if_missing;
use jupytercluster_core::registry::{ClusterBackend, DriverBackend};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a default config file if none exists
    Init {
        /// Grant admin rights to this user (repeatable)
        #[arg(long = "admin", value_name = "USER")]
        admins: Vec<String>,

        /// Use the dry-run driver and in-memory cluster backends
        #[arg(long)]
        offline: bool,
    },

    /// Print the effective config
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init { admins, offline } => init(path, admins, offline, json),
        ConfigSubcommand::Show => show(path, json),
        ConfigSubcommand::Validate => validate(path, json),
    }
}

fn init(path: &Path, admins: Vec<String>, offline: bool, json: bool) -> anyhow::Result<()> {
    let mut config = Config {
        admin_users: admins,
        ..Config::default()
    };
    if offline {
        config.backend.driver = DriverBackend::DryRun;
        config.backend.cluster = ClusterBackend::InMemory;
    }
    let data = serde_yaml::to_string(&config)?;
    let created = write_if_missing(path, data.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        print_json(&serde_json::json!({
            "path": path,
            "created": created,
        }))?;
    } else if created {
        println!("Wrote {}", path.display());
    } else {
        println!("{} already exists; left unchanged", path.display());
    }
    Ok(())
}

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load config")?;
    if json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
