//! App registry - the set of configured apps, keyed by name and alias

mod app_config;
mod watcher;

pub use app_config::*;
pub use watcher::*;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// What changed between two loads
#[derive(Debug, Default)]
pub struct RegistryDiff {
    pub added: Vec<Arc<AppDefinition>>,
    pub removed: Vec<Arc<AppDefinition>>,
    /// Layout changed; running processes must restart
    pub changed: Vec<Arc<AppDefinition>>,
    /// Only metadata (description, aliases, ...) changed
    pub updated: Vec<Arc<AppDefinition>>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.updated.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    apps: BTreeMap<String, Arc<AppDefinition>>,
    /// alias -> app name
    aliases: HashMap<String, String>,
}

impl RegistryState {
    fn build(defs: Vec<AppDefinition>) -> Self {
        let apps: BTreeMap<String, Arc<AppDefinition>> = defs
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();

        let mut aliases = HashMap::new();
        for app in apps.values() {
            for alias in &app.aliases {
                // Real app names always win over aliases.
                if apps.contains_key(alias) {
                    tracing::warn!(app = %app.name, alias = %alias, "Alias shadows an app name, ignoring");
                    continue;
                }
                if let Some(owner) = aliases.insert(alias.clone(), app.name.clone()) {
                    tracing::warn!(alias = %alias, first = %owner, second = %app.name, "Alias claimed twice");
                    aliases.insert(alias.clone(), owner);
                }
            }
        }
        Self { apps, aliases }
    }
}

pub struct AppRegistry {
    dir: PathBuf,
    state: RwLock<RegistryState>,
}

impl AppRegistry {
    /// Registry with nothing loaded yet
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Read the config directory.
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let registry = Self::new(dir);
        registry.reload();
        registry
    }

    /// Re-read the config directory and report what changed.
    pub fn reload(&self) -> RegistryDiff {
        let defs = load_dir(&self.dir);
        let diff = self.replace(defs);
        if !diff.is_empty() {
            tracing::info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                updated = diff.updated.len(),
                "App config reloaded"
            );
        }
        diff
    }

    /// Swap in a new set of definitions.
    pub fn replace(&self, defs: Vec<AppDefinition>) -> RegistryDiff {
        let next = RegistryState::build(defs);
        let mut state = self.state.write();

        let mut diff = RegistryDiff::default();
        for (name, app) in &next.apps {
            match state.apps.get(name) {
                None => diff.added.push(app.clone()),
                Some(old) if old.needs_restart(app) => diff.changed.push(app.clone()),
                Some(old) if **old != **app => diff.updated.push(app.clone()),
                Some(_) => {}
            }
        }
        for (name, app) in &state.apps {
            if !next.apps.contains_key(name) {
                diff.removed.push(app.clone());
            }
        }

        *state = next;
        diff
    }

    /// Look up by name, then by alias.
    pub fn resolve(&self, name: &str) -> Option<Arc<AppDefinition>> {
        let state = self.state.read();
        if let Some(app) = state.apps.get(name) {
            return Some(app.clone());
        }
        state
            .aliases
            .get(name)
            .and_then(|canonical| state.apps.get(canonical))
            .cloned()
    }

    /// Every app, sorted by name
    pub fn all(&self) -> Vec<Arc<AppDefinition>> {
        self.state.read().apps.values().cloned().collect()
    }

    /// Config file for an app. For unknown names, where a new one would go.
    pub fn config_path(&self, name: &str) -> PathBuf {
        match self.resolve(name) {
            Some(app) => app.source.clone(),
            None => self.dir.join(format!("{name}.toml")),
        }
    }
}
