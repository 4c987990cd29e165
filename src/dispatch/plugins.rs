use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info};

use super::{Command, MessageHandler, Registry};

/// Everything one plugin unit wants to register.
#[derive(Default)]
pub struct PluginManifest {
    pub commands: Vec<Command>,
    pub handlers: Vec<MessageHandler>,
}

/// An independently loadable bundle of command/handler registrations.
///
/// Units register through an explicit function returning their descriptors;
/// a unit whose registration fails is recorded and skipped without affecting
/// the others.
pub struct PluginUnit {
    pub name: &'static str,
    pub register: fn() -> Result<PluginManifest>,
}

/// Load outcome for one unit, surfaced by the status report.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    pub name: String,
    pub commands: Vec<String>,
    pub handlers: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginLoadError {
    pub unit: String,
    pub message: String,
}

/// Units register through compiled-in functions, not a scanned directory.
const PLUGIN_SOURCE: &str = "compiled-in";

#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub source: &'static str,
    pub loaded_count: usize,
    pub command_count: usize,
    pub handler_count: usize,
    pub loaded_plugins: Vec<String>,
    pub errors: Vec<PluginLoadError>,
}

struct Loaded {
    registry: Arc<Registry>,
    records: Vec<PluginRecord>,
}

/// Builds the command/handler registry from the configured plugin units.
///
/// `reload` constructs the replacement registry off to the side and swaps it
/// in once complete, so a concurrent reader always sees either the old or the
/// new snapshot, never a partially-cleared one.
pub struct PluginLoader {
    units: Vec<PluginUnit>,
    loaded: RwLock<Loaded>,
}

impl PluginLoader {
    pub fn new(units: Vec<PluginUnit>) -> Self {
        Self {
            units,
            loaded: RwLock::new(Loaded {
                registry: Arc::new(Registry::new()),
                records: Vec::new(),
            }),
        }
    }

    /// Re-scan all units and atomically replace the registry snapshot.
    pub async fn reload(&self) -> PluginStatus {
        let mut registry = Registry::new();
        let mut records = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            let record = match (unit.register)() {
                Ok(manifest) => {
                    match registry.register_unit(manifest.commands, manifest.handlers) {
                        Ok((commands, handlers)) => {
                            info!(
                                "Loaded plugin unit '{}': {} commands, {} handlers",
                                unit.name,
                                commands.len(),
                                handlers.len()
                            );
                            PluginRecord {
                                name: unit.name.to_string(),
                                commands,
                                handlers,
                                error: None,
                            }
                        }
                        Err(e) => {
                            error!("Plugin unit '{}' rejected: {:#}", unit.name, e);
                            PluginRecord {
                                name: unit.name.to_string(),
                                commands: Vec::new(),
                                handlers: Vec::new(),
                                error: Some(format!("{:#}", e)),
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Plugin unit '{}' failed to load: {:#}", unit.name, e);
                    PluginRecord {
                        name: unit.name.to_string(),
                        commands: Vec::new(),
                        handlers: Vec::new(),
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            records.push(record);
        }

        let status = Self::status_of(&registry, &records);
        let mut loaded = self.loaded.write().await;
        *loaded = Loaded {
            registry: Arc::new(registry),
            records,
        };
        status
    }

    /// Current registry snapshot.
    pub async fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.loaded.read().await.registry)
    }

    pub async fn status(&self) -> PluginStatus {
        let loaded = self.loaded.read().await;
        Self::status_of(&loaded.registry, &loaded.records)
    }

    fn status_of(registry: &Registry, records: &[PluginRecord]) -> PluginStatus {
        PluginStatus {
            source: PLUGIN_SOURCE,
            loaded_count: records.iter().filter(|r| r.error.is_none()).count(),
            command_count: registry.command_count(),
            handler_count: registry.handler_count(),
            loaded_plugins: records
                .iter()
                .filter(|r| r.error.is_none())
                .map(|r| r.name.clone())
                .collect(),
            errors: records
                .iter()
                .filter_map(|r| {
                    r.error.as_ref().map(|e| PluginLoadError {
                        unit: r.name.clone(),
                        message: e.clone(),
                    })
                })
                .collect(),
        }
    }
}
