use anyhow::Result;
use chrono::Local;

use super::plugins::{PluginManifest, PluginUnit};
use super::{Command, CommandContext};

/// Core commands every deployment gets.
pub fn unit() -> PluginUnit {
    PluginUnit {
        name: "builtin",
        register,
    }
}

fn register() -> Result<PluginManifest> {
    let mut manifest = PluginManifest::default();

    manifest.commands.push(
        Command::new("ping", |_ctx| Box::pin(async { Ok("pong".to_string()) }))
            .description("Liveness check"),
    );

    manifest.commands.push(
        Command::new("help", |ctx| Box::pin(help(ctx)))
            .aliases(&["h", "?"])
            .description("List available commands"),
    );

    manifest.commands.push(
        Command::new("echo", |ctx| {
            Box::pin(async move {
                if ctx.args.is_empty() {
                    Ok("Usage: echo <text>".to_string())
                } else {
                    Ok(ctx.args.join(" "))
                }
            })
        })
        .usage("echo <text>")
        .description("Repeat the given text"),
    );

    manifest.commands.push(
        Command::new("status", |ctx| Box::pin(status(ctx)))
            .aliases(&["stat", "info"])
            .description("Show runtime status"),
    );

    manifest.commands.push(
        Command::new("task", |ctx| Box::pin(task(ctx)))
            .usage("task list | add <HH:MM> <command> | del <id> | on <id> | off <id> | run <id>")
            .description("Manage scheduled tasks"),
    );

    manifest.commands.push(
        Command::new("plugins", |ctx| Box::pin(plugins(ctx)))
            .aliases(&["plugin"])
            .description("Show loaded plugins"),
    );

    manifest.commands.push(
        Command::new("reload", |ctx| {
            Box::pin(async move {
                let status = ctx.services.plugins.reload().await;
                Ok(format!(
                    "Reloaded {} plugins ({} commands, {} handlers, {} errors)",
                    status.loaded_count,
                    status.command_count,
                    status.handler_count,
                    status.errors.len()
                ))
            })
        })
        .hidden(),
    );

    Ok(manifest)
}

async fn help(ctx: CommandContext) -> Result<String> {
    let registry = ctx.services.plugins.registry().await;
    Ok(registry.help_text(&ctx.services.config.dispatch.command_prefix))
}

async fn status(ctx: CommandContext) -> Result<String> {
    let services = &ctx.services;
    let snapshot = services.stability.lock().await.snapshot();
    let plugin_status = services.plugins.status().await;
    let uptime = services.uptime_secs();

    Ok(format!(
        "Relay status\n\
         Time: {}\n\
         Uptime: {}h {}m {}s\n\
         Connected: {}\n\
         Messages processed: {}\n\
         Reconnect attempts: {}\n\
         Scheduled tasks: {}\n\
         Plugins: {} loaded, {} commands",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        uptime / 3600,
        (uptime % 3600) / 60,
        uptime % 60,
        services.transport.is_connected(),
        snapshot.total_messages,
        snapshot.reconnect_attempts,
        services.tasks.len().await,
        plugin_status.loaded_count,
        plugin_status.command_count,
    ))
}

async fn task(ctx: CommandContext) -> Result<String> {
    let services = &ctx.services;
    let usage = "Usage: task list | add <HH:MM> <command> | del <id> | on <id> | off <id> | run <id>";

    let Some(sub) = ctx.args.first() else {
        return Ok(usage.to_string());
    };

    match sub.as_str() {
        "list" => {
            let tasks = services.tasks.list().await;
            if tasks.is_empty() {
                return Ok("No scheduled tasks".to_string());
            }
            let mut out = String::from("Scheduled tasks:\n");
            for task in tasks {
                let state = if task.enabled { "on" } else { "off" };
                out.push_str(&format!(
                    "{} [{}] {} {}\n",
                    task.id, state, task.time_hm, task.command_text
                ));
            }
            Ok(out.trim_end().to_string())
        }
        "add" => {
            if ctx.args.len() < 3 {
                return Ok("Usage: task add <HH:MM> <command>".to_string());
            }
            let time_hm = &ctx.args[1];
            let command_text = ctx.args[2..].join(" ");
            match services.tasks.add(time_hm, &command_text, "").await {
                Ok(task) => Ok(format!("Task {} scheduled at {}", task.id, task.time_hm)),
                Err(e) => Ok(format!("Cannot add task: {}", e)),
            }
        }
        "del" => {
            let Some(id) = ctx.args.get(1) else {
                return Ok("Usage: task del <id>".to_string());
            };
            if services.tasks.delete(id).await {
                Ok(format!("Task {} deleted", id))
            } else {
                Ok(format!("No task with id {}", id))
            }
        }
        "on" | "off" => {
            let Some(id) = ctx.args.get(1) else {
                return Ok(format!("Usage: task {} <id>", sub));
            };
            let enabled = sub == "on";
            if services.tasks.set_enabled(id, enabled).await {
                Ok(format!("Task {} {}", id, if enabled { "enabled" } else { "disabled" }))
            } else {
                Ok(format!("No task with id {}", id))
            }
        }
        "run" => {
            let Some(id) = ctx.args.get(1) else {
                return Ok("Usage: task run <id>".to_string());
            };
            if services.run_task_now(id).await {
                Ok(String::new())
            } else {
                Ok(format!("No task with id {}", id))
            }
        }
        _ => Ok(usage.to_string()),
    }
}

async fn plugins(ctx: CommandContext) -> Result<String> {
    let status = ctx.services.plugins.status().await;
    let mut out = format!(
        "Plugins ({}): {} loaded ({} commands, {} handlers)\n",
        status.source, status.loaded_count, status.command_count, status.handler_count
    );
    for name in &status.loaded_plugins {
        out.push_str(&format!("  {}\n", name));
    }
    for err in &status.errors {
        out.push_str(&format!("  {} [error: {}]\n", err.unit, err.message));
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{scripted_services, ScriptedTransport};
    use crate::transport::InboundMessage;
    use std::sync::Arc;

    async fn services() -> Arc<crate::dispatch::Services> {
        let transport = Arc::new(ScriptedTransport::connected());
        scripted_services(transport, vec![unit()]).await
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let services = services().await;
        let reply = services.dispatch(&InboundMessage::text("1", "/ping")).await;
        assert_eq!(reply.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn help_lists_visible_commands_only() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/help"))
            .await
            .unwrap();
        assert!(reply.contains("/ping"));
        assert!(reply.contains("/task"));
        assert!(!reply.contains("reload"));
    }

    #[tokio::test]
    async fn echo_repeats_arguments() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/echo hello   world"))
            .await;
        assert_eq!(reply.as_deref(), Some("hello world"));

        let reply = services.dispatch(&InboundMessage::text("2", "/echo")).await;
        assert_eq!(reply.as_deref(), Some("Usage: echo <text>"));
    }

    #[tokio::test]
    async fn status_reports_connection_and_counts() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/status"))
            .await
            .unwrap();
        assert!(reply.contains("Connected: true"));
        assert!(reply.contains("Scheduled tasks: 0"));
    }

    #[tokio::test]
    async fn task_subcommands_manage_the_table() {
        let services = services().await;

        let reply = services
            .dispatch(&InboundMessage::text("1", "/task add 09:30 /ping"))
            .await
            .unwrap();
        assert!(reply.contains("scheduled at 09:30"));

        let listed = services
            .dispatch(&InboundMessage::text("2", "/task list"))
            .await
            .unwrap();
        assert!(listed.contains("09:30 /ping"));

        let id = services.tasks.list().await[0].id.clone();
        let reply = services
            .dispatch(&InboundMessage::text("3", &format!("/task off {}", id)))
            .await
            .unwrap();
        assert!(reply.contains("disabled"));

        let reply = services
            .dispatch(&InboundMessage::text("4", &format!("/task del {}", id)))
            .await
            .unwrap();
        assert!(reply.contains("deleted"));
        assert_eq!(services.tasks.len().await, 0);
    }

    #[tokio::test]
    async fn task_add_rejects_bad_time() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/task add 25:99 /ping"))
            .await
            .unwrap();
        assert!(reply.contains("Cannot add task"));
    }

    #[tokio::test]
    async fn plugins_command_shows_loaded_units() {
        let services = services().await;
        let reply = services
            .dispatch(&InboundMessage::text("1", "/plugins"))
            .await
            .unwrap();
        assert!(reply.contains("builtin"));
    }
}
