use crate::cmd::PlanSource;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tre_core::catalog::Catalog;
use tre_core::checkpoint::Checkpoint;
use tre_core::config::Config;
use tre_core::inventory::{InventoryLoader, LiveSnapshot};
use tre_core::plan::{self, Plan, PlanOptions};
use tre_core::tracker::{MemoryTracker, Tracker, XrayClient};

/// Flags shared by every command.
pub struct Globals {
    pub config: Option<PathBuf>,
    pub project: Option<String>,
    pub base_url: Option<String>,
}

impl Globals {
    /// Defaults, then the YAML file, then `TRE_*` variables, then flags.
    pub fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        if let Some(project) = &self.project {
            config.project_key = project.clone();
        }
        if let Some(url) = &self.base_url {
            config.tracker_base_url = url.clone();
        }
        Ok(config)
    }
}

pub fn load_catalog(paths: &[PathBuf], keys_from: Option<&Path>) -> anyhow::Result<Catalog> {
    let catalog = Catalog::load(paths).context("failed to load catalog")?;
    let Some(path) = keys_from else {
        return Ok(catalog);
    };
    let cp = Checkpoint::load(path)
        .with_context(|| format!("failed to read keys from {}", path.display()))?;
    Ok(catalog.adopt_keys(&cp.symbolic_refs))
}

/// Validate the tracker settings and authenticate once.
pub fn connect(config: &Config) -> anyhow::Result<XrayClient> {
    config.validate(true)?;
    let mut client = XrayClient::new(config)?;
    client
        .authenticate()
        .context("tracker authentication failed")?;
    Ok(client)
}

/// The tracker a command talks to: the real one, or an in-memory copy of a
/// saved snapshot.
pub enum Backend {
    Live(XrayClient),
    Offline(MemoryTracker),
}

impl Backend {
    pub fn tracker(&mut self) -> &mut dyn Tracker {
        match self {
            Backend::Live(client) => client,
            Backend::Offline(memory) => memory,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Backend::Offline(_))
    }
}

/// Resolve the live state for `catalog` and return it with the backend
/// that produced it.
pub fn snapshot(
    config: &mut Config,
    source: &PlanSource,
    catalog: Option<&Catalog>,
) -> anyhow::Result<(LiveSnapshot, Backend)> {
    if let Some(path) = &source.snapshot {
        let snap = LiveSnapshot::load(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        if config.project_key.is_empty() {
            config.project_key = snap.project.clone();
        }
        config.validate(false)?;
        let memory = MemoryTracker::from_snapshot(&snap);
        return Ok((snap, Backend::Offline(memory)));
    }

    let mut client = connect(config)?;
    let snap = InventoryLoader::new(&mut client, &config.project_key, config.page_size)
        .load(catalog)
        .context("failed to load tracker inventory")?;
    Ok((snap, Backend::Live(client)))
}

pub fn build_plan(
    catalog: &Catalog,
    snapshot: &LiveSnapshot,
    backend: &mut Backend,
    close: bool,
) -> Plan {
    let options = PlanOptions {
        enable_closure: close,
        capabilities: backend.tracker().capabilities(),
    };
    plan::plan_with(catalog, snapshot, &options)
}
