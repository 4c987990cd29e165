pub mod builtin;
pub mod extras;
pub mod plugins;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::stability::{SharedStability, StabilityState};
use crate::storage::Storage;
use crate::tasks::TaskTable;
use crate::transport::{InboundMessage, MessageKind, Transport};

use self::plugins::{PluginLoader, PluginUnit};

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;
pub type CommandFn = Arc<dyn Fn(CommandContext) -> CommandFuture + Send + Sync>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<String>>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(CommandContext) -> HandlerFuture + Send + Sync>;

/// Invocation context handed to commands and message handlers.
#[derive(Clone)]
pub struct CommandContext {
    /// Whitespace-split tokens after the command token.
    pub args: Vec<String>,
    /// The raw inbound message that triggered the invocation.
    pub msg: InboundMessage,
    /// Handle to the orchestrator's shared services.
    pub services: Arc<Services>,
}

/// A named command registered by a plugin unit.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub usage: String,
    pub hidden: bool,
    pub handler: CommandFn,
}

impl Command {
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: Fn(CommandContext) -> CommandFuture + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            description: String::new(),
            usage: String::new(),
            hidden: false,
            handler: Arc::new(handler),
        }
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn usage(mut self, usage: &str) -> Self {
        self.usage = usage.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// A generic message handler; the chain runs highest priority first and the
/// first handler returning a reply terminates it.
#[derive(Clone)]
pub struct MessageHandler {
    pub name: String,
    pub priority: i32,
    pub handler: HandlerFn,
}

impl MessageHandler {
    pub fn new<F>(name: &str, priority: i32, handler: F) -> Self
    where
        F: Fn(CommandContext) -> HandlerFuture + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            priority,
            handler: Arc::new(handler),
        }
    }
}

/// Immutable snapshot of registered commands and handlers. Built fresh by the
/// plugin loader and swapped in as a whole, so readers never see a
/// half-populated registry.
#[derive(Default)]
pub struct Registry {
    commands: Vec<Arc<Command>>,
    lookup: HashMap<String, usize>,
    handlers: Vec<Arc<MessageHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every descriptor of one plugin unit, or none of them.
    ///
    /// Command names and aliases collide case-insensitively; the unit that
    /// introduces a collision is rejected whole so the registry never holds a
    /// partially applied unit.
    pub fn register_unit(
        &mut self,
        commands: Vec<Command>,
        handlers: Vec<MessageHandler>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut new_keys: Vec<(String, usize)> = Vec::new();
        let base = self.commands.len();
        for (i, cmd) in commands.iter().enumerate() {
            for key in std::iter::once(&cmd.name).chain(cmd.aliases.iter()) {
                let key = key.to_lowercase();
                if self.lookup.contains_key(&key) || new_keys.iter().any(|(k, _)| *k == key) {
                    anyhow::bail!("command name collision: '{}'", key);
                }
                new_keys.push((key, base + i));
            }
        }

        let command_names = commands.iter().map(|c| c.name.clone()).collect();
        let handler_names = handlers.iter().map(|h| h.name.clone()).collect();

        for cmd in commands {
            self.commands.push(Arc::new(cmd));
        }
        for (key, index) in new_keys {
            self.lookup.insert(key, index);
        }
        for handler in handlers {
            self.handlers.push(Arc::new(handler));
        }
        self.handlers.sort_by_key(|h| std::cmp::Reverse(h.priority));

        Ok((command_names, handler_names))
    }

    /// Resolve a command token by exact name or alias, case-insensitively.
    pub fn resolve(&self, token: &str) -> Option<Arc<Command>> {
        self.lookup
            .get(&token.to_lowercase())
            .map(|&i| Arc::clone(&self.commands[i]))
    }

    /// Handlers in descending priority order.
    pub fn handlers(&self) -> &[Arc<MessageHandler>] {
        &self.handlers
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Help listing of all non-hidden commands, sorted by name.
    pub fn help_text(&self, prefix: &str) -> String {
        let mut visible: Vec<&Arc<Command>> =
            self.commands.iter().filter(|c| !c.hidden).collect();
        visible.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = String::from("Available commands:\n");
        for cmd in visible {
            out.push_str(&format!("{}{}", prefix, cmd.name));
            if !cmd.aliases.is_empty() {
                out.push_str(&format!(" ({})", cmd.aliases.join(", ")));
            }
            if !cmd.description.is_empty() {
                out.push_str(&format!(" - {}", cmd.description));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// Shared services handed to every loop and to command/handler contexts.
pub struct Services {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub stability: SharedStability,
    pub tasks: TaskTable,
    pub plugins: PluginLoader,
    pub started_at: DateTime<Utc>,
    /// Serializes outgoing sends: a send is a multi-step transport
    /// interaction whose steps must not interleave across loops.
    send_gate: Mutex<()>,
}

impl Services {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        units: Vec<PluginUnit>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            storage,
            stability: StabilityState::shared(),
            tasks: TaskTable::new(),
            plugins: PluginLoader::new(units),
            started_at: Utc::now(),
            send_gate: Mutex::new(()),
        })
    }

    /// Send a reply through the transport, one send at a time.
    pub async fn send_text(&self, text: &str) -> Result<bool> {
        let _gate = self.send_gate.lock().await;
        self.transport.send_text(text).await
    }

    /// Resolve a message to a command or run it down the handler chain.
    /// Returns at most one reply.
    pub async fn dispatch(self: &Arc<Self>, msg: &InboundMessage) -> Option<String> {
        let registry = self.plugins.registry().await;
        let text = msg.text.trim();
        let prefix = &self.config.dispatch.command_prefix;

        if let Some(rest) = text.strip_prefix(prefix.as_str()) {
            let mut parts = rest.split_whitespace();
            if let Some(token) = parts.next() {
                if let Some(cmd) = registry.resolve(token) {
                    let ctx = CommandContext {
                        args: parts.map(str::to_string).collect(),
                        msg: msg.clone(),
                        services: Arc::clone(self),
                    };
                    info!("Dispatching command '{}'", cmd.name);
                    return match (cmd.handler)(ctx).await {
                        Ok(reply) if reply.is_empty() => None,
                        Ok(reply) => Some(reply),
                        Err(e) => {
                            warn!("Command '{}' failed: {:#}", cmd.name, e);
                            Some(format!("Error: {}", e))
                        }
                    };
                }
            }
            // Unknown command token: fall through to the handler chain.
        }

        for handler in registry.handlers() {
            let ctx = CommandContext {
                args: Vec::new(),
                msg: msg.clone(),
                services: Arc::clone(self),
            };
            match (handler.handler)(ctx).await {
                Ok(Some(reply)) if !reply.is_empty() => return Some(reply),
                Ok(_) => {}
                Err(e) => warn!("Message handler '{}' failed: {:#}", handler.name, e),
            }
        }

        None
    }

    /// Run a command line through the pipeline as if it arrived as a message.
    pub async fn execute_command_text(self: &Arc<Self>, text: &str) -> Option<String> {
        let msg = InboundMessage {
            id: String::new(),
            text: text.to_string(),
            kind: MessageKind::Text,
            file_name: None,
        };
        self.dispatch(&msg).await
    }

    /// Execute a scheduled task immediately regardless of its enabled flag.
    /// Returns false when the task id is unknown.
    pub async fn run_task_now(self: &Arc<Self>, task_id: &str) -> bool {
        let Some(task) = self.tasks.get(task_id).await else {
            return false;
        };
        info!("Manually running task {} ({})", task.id, task.command_text);
        if let Some(reply) = self.execute_command_text(&task.command_text).await {
            if let Err(e) = self.send_text(&reply).await {
                warn!("Failed to send task reply: {:#}", e);
            }
        }
        true
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::plugins::PluginManifest;
    use crate::testkit::{scripted_services, ScriptedTransport};

    fn test_unit() -> PluginUnit {
        PluginUnit {
            name: "test",
            register: || {
                let mut manifest = PluginManifest::default();
                manifest.commands.push(
                    Command::new("ping", |_ctx| Box::pin(async { Ok("pong".to_string()) }))
                        .aliases(&["p"]),
                );
                manifest.commands.push(Command::new("fail", |_ctx| {
                    Box::pin(async { anyhow::bail!("boom") })
                }));
                manifest.handlers.push(MessageHandler::new(
                    "greeter",
                    50,
                    |ctx| {
                        Box::pin(async move {
                            Ok((ctx.msg.text == "hello").then(|| "hi there".to_string()))
                        })
                    },
                ));
                manifest.handlers.push(MessageHandler::new(
                    "fallback",
                    -10,
                    |_ctx| Box::pin(async { Ok(Some("fallback".to_string())) }),
                ));
                Ok(manifest)
            },
        }
    }

    async fn services() -> Arc<Services> {
        let transport = Arc::new(ScriptedTransport::connected());
        scripted_services(transport, vec![test_unit()]).await
    }

    #[tokio::test]
    async fn command_resolution_by_name_and_alias() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/ping"))
            .await;
        assert_eq!(reply.as_deref(), Some("pong"));

        let reply = services.dispatch(&InboundMessage::text("2", "/p")).await;
        assert_eq!(reply.as_deref(), Some("pong"));

        // Case-insensitive.
        let reply = services
            .dispatch(&InboundMessage::text("3", "/PING"))
            .await;
        assert_eq!(reply.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn unknown_command_falls_through_to_handlers() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/nosuch"))
            .await;
        assert_eq!(reply.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn handler_chain_respects_priority() {
        let services = services().await;
        // Both handlers would reply to "hello"; the higher-priority one wins.
        let reply = services
            .dispatch(&InboundMessage::text("1", "hello"))
            .await;
        assert_eq!(reply.as_deref(), Some("hi there"));

        // Other text skips the greeter and reaches the fallback.
        let reply = services
            .dispatch(&InboundMessage::text("2", "anything"))
            .await;
        assert_eq!(reply.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn command_error_is_reported_to_caller() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/fail"))
            .await;
        assert_eq!(reply.as_deref(), Some("Error: boom"));
    }

    #[tokio::test]
    async fn no_handler_opinion_means_no_reply() {
        let transport = Arc::new(ScriptedTransport::connected());
        let services = scripted_services(
            transport,
            vec![PluginUnit {
                name: "silent",
                register: || Ok(PluginManifest::default()),
            }],
        )
        .await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "hello"))
            .await;
        assert_eq!(reply, None);
    }

    #[test]
    fn registry_rejects_collisions_atomically() {
        let mut registry = Registry::new();
        registry
            .register_unit(
                vec![Command::new("ping", |_ctx| {
                    Box::pin(async { Ok(String::new()) })
                })],
                vec![],
            )
            .unwrap();

        // Second unit collides on an alias; none of its commands land.
        let err = registry.register_unit(
            vec![
                Command::new("status", |_ctx| Box::pin(async { Ok(String::new()) })),
                Command::new("probe", |_ctx| Box::pin(async { Ok(String::new()) }))
                    .aliases(&["PING"]),
            ],
            vec![],
        );
        assert!(err.is_err());
        assert_eq!(registry.command_count(), 1);
        assert!(registry.resolve("status").is_none());
    }

    #[test]
    fn help_text_hides_hidden_commands() {
        let mut registry = Registry::new();
        registry
            .register_unit(
                vec![
                    Command::new("ping", |_ctx| Box::pin(async { Ok(String::new()) }))
                        .description("liveness"),
                    Command::new("secret", |_ctx| Box::pin(async { Ok(String::new()) }))
                        .hidden(),
                ],
                vec![],
            )
            .unwrap();
        let help = registry.help_text("/");
        assert!(help.contains("/ping"));
        assert!(!help.contains("secret"));
    }
}
