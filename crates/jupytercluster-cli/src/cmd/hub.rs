use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use jupytercluster_core::config::Config;
use jupytercluster_core::registry::BackendRegistry;
use jupytercluster_core::sanitize::{parse_overrides, AuditAction};
use jupytercluster_core::types::{Actor, HubId, HubRecord, HubState};
use jupytercluster_core::LifecycleController;
use std::io::Read;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum HubSubcommand {
    /// Register a new hub (does not deploy it)
    Create {
        name: String,
        /// YAML or JSON chart overrides; `-` reads stdin
        #[arg(long, value_name = "FILE")]
        values: Option<PathBuf>,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Deploy or repair a hub and wait for it to settle
    Start { name: String },

    /// Uninstall a hub's release, keeping its namespace
    Stop { name: String },

    /// Uninstall a hub and delete its namespace
    Delete {
        name: String,
        /// Supersede an in-flight install or stop
        #[arg(long)]
        force: bool,
    },

    /// Show one hub
    Get { name: String },

    /// List hubs visible to the actor
    List,

    /// Show a hub's operation history
    Operations { name: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config: &Path, actor: &str, subcmd: HubSubcommand, json: bool) -> anyhow::Result<()> {
    let cfg = Config::load(config).context("failed to load config")?;
    let actor = cfg.actor(actor);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let controller = LifecycleController::from_config(&cfg, &BackendRegistry::builtin())?;
        controller.recover()?;
        let session = Session {
            controller,
            actor,
            json,
        };
        match subcmd {
            HubSubcommand::Create {
                name,
                values,
                description,
            } => session.create(&name, values.as_deref(), &description).await,
            HubSubcommand::Start { name } => session.start(&name).await,
            HubSubcommand::Stop { name } => session.stop(&name).await,
            HubSubcommand::Delete { name, force } => session.delete(&name, force).await,
            HubSubcommand::Get { name } => session.get(&name).await,
            HubSubcommand::List => session.list().await,
            HubSubcommand::Operations { name } => session.operations(&name).await,
        }
    })
}

struct Session {
    controller: LifecycleController,
    actor: Actor,
    json: bool,
}

impl Session {
    async fn resolve(&self, name: &str) -> anyhow::Result<HubId> {
        self.controller
            .find_hub(name)
            .await?
            .with_context(|| format!("hub '{name}' not found"))
    }

    async fn create(
        &self,
        name: &str,
        values: Option<&Path>,
        description: &str,
    ) -> anyhow::Result<()> {
        let overrides = match values {
            None => serde_json::Value::Object(serde_json::Map::new()),
            Some(path) => parse_overrides(&read_values(path)?)?,
        };
        let id = self
            .controller
            .create_hub(&self.actor, name, &overrides, description)
            .await?;
        let record = self.controller.get_hub(&self.actor, id).await?;

        if self.json {
            print_json(&record)?;
            return Ok(());
        }
        println!(
            "Created hub '{}' in namespace {}",
            record.hub.name, record.hub.namespace
        );
        for entry in &record.hub.audit {
            let verb = match entry.action {
                AuditAction::Removed => "stripped",
                AuditAction::Rewritten => "rewrote",
            };
            println!("  {verb} {}: {}", entry.path, entry.reason);
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        let id = self.resolve(name).await?;
        self.controller.start_hub(&self.actor, id).await?;
        self.settle(name, id).await
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let id = self.resolve(name).await?;
        self.controller.stop_hub(&self.actor, id).await?;
        self.settle(name, id).await
    }

    async fn delete(&self, name: &str, force: bool) -> anyhow::Result<()> {
        let id = self.resolve(name).await?;
        self.controller.delete_hub(&self.actor, id, force).await?;
        self.controller.wait_idle(id).await;

        if self.controller.find_hub(name).await?.is_some() {
            return self.settle(name, id).await;
        }
        if self.json {
            print_json(&serde_json::json!({ "name": name, "state": HubState::Deleted }))?;
        } else {
            println!("Deleted hub '{name}'");
        }
        Ok(())
    }

    /// Wait for in-flight work, print the outcome, and fail if the hub
    /// ended in `error`.
    async fn settle(&self, name: &str, id: HubId) -> anyhow::Result<()> {
        self.controller.wait_idle(id).await;
        let record = self.controller.get_hub(&self.actor, id).await?;
        if self.json {
            print_json(&record)?;
        } else {
            print_record(&record);
        }
        if record.hub.state == HubState::Error {
            anyhow::bail!(
                "hub '{name}' failed: {}",
                record.hub.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> anyhow::Result<()> {
        let id = self.resolve(name).await?;
        let record = self.controller.get_hub(&self.actor, id).await?;
        if self.json {
            print_json(&record)?;
        } else {
            print_record(&record);
        }
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<()> {
        let records = self.controller.list_hubs(&self.actor).await?;
        if self.json {
            print_json(&records)?;
            return Ok(());
        }
        if records.is_empty() {
            println!("No hubs.");
            return Ok(());
        }
        let rows = records
            .iter()
            .map(|r| {
                vec![
                    r.hub.name.clone(),
                    r.hub.state.to_string(),
                    r.hub.owner.clone(),
                    r.hub.namespace.clone(),
                    or_dash(r.hub.url.as_deref()),
                ]
            })
            .collect();
        print_table(&["NAME", "STATE", "OWNER", "NAMESPACE", "URL"], rows);
        Ok(())
    }

    async fn operations(&self, name: &str) -> anyhow::Result<()> {
        let id = self.resolve(name).await?;
        let ops = self.controller.operations(&self.actor, id).await?;
        if self.json {
            print_json(&ops)?;
            return Ok(());
        }
        let rows = ops
            .iter()
            .map(|op| {
                vec![
                    op.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    op.kind.to_string(),
                    op.status.label().to_string(),
                    op.attempts.to_string(),
                    or_dash(op.diagnostic()),
                ]
            })
            .collect();
        print_table(&["CREATED", "KIND", "STATUS", "ATTEMPTS", "DIAGNOSTIC"], rows);
        Ok(())
    }
}

fn read_values(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read values from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_record(record: &HubRecord) {
    let hub = &record.hub;
    println!("Hub:       {}", hub.name);
    println!("State:     {}", hub.state);
    println!("Owner:     {}", hub.owner);
    println!("Namespace: {}", hub.namespace);
    println!("Release:   {}", hub.release_name);
    println!("URL:       {}", or_dash(hub.url.as_deref()));
    if let Some(op) = &record.active_operation {
        println!("Operation: {} ({})", op.kind, op.status.label());
    }
    if let Some(err) = &hub.last_error {
        println!("Error:     {err}");
    }
}
