use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use uuid::Uuid;

use super::plugins::{PluginManifest, PluginUnit};
use super::{Command, CommandContext, MessageHandler};

const HTTPGET_TIMEOUT: Duration = Duration::from_secs(10);
const HTTPGET_BODY_LIMIT: usize = 500;

/// Convenience commands and the auto-reply handler.
pub fn unit() -> PluginUnit {
    PluginUnit {
        name: "extras",
        register,
    }
}

fn register() -> Result<PluginManifest> {
    let mut manifest = PluginManifest::default();

    manifest.commands.push(
        Command::new("time", |_ctx| {
            Box::pin(async {
                Ok(Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string())
            })
        })
        .aliases(&["now", "date"])
        .description("Current local time"),
    );

    manifest.commands.push(
        Command::new("uuid", |_ctx| {
            Box::pin(async { Ok(Uuid::new_v4().to_string()) })
        })
        .description("Generate a random UUID"),
    );

    manifest.commands.push(
        Command::new("httpget", |ctx| Box::pin(httpget(ctx)))
            .usage("httpget <url>")
            .description("Fetch a URL and show the response"),
    );

    manifest.handlers.push(MessageHandler::new("auto_reply", 10, |ctx| {
        Box::pin(async move { Ok(auto_reply(&ctx.msg.text)) })
    }));

    Ok(manifest)
}

async fn httpget(ctx: CommandContext) -> Result<String> {
    let Some(url) = ctx.args.first() else {
        return Ok("Usage: httpget <url>".to_string());
    };
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Ok("Only http(s) URLs are supported".to_string());
    }

    let client = reqwest::Client::builder()
        .timeout(HTTPGET_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", url))?;
    let status = resp.status();
    let body = resp.text().await.context("Failed to read response body")?;

    let mut shown: String = body.chars().take(HTTPGET_BODY_LIMIT).collect();
    if body.chars().count() > HTTPGET_BODY_LIMIT {
        shown.push_str("...");
    }
    Ok(format!("HTTP {}\n{}", status.as_u16(), shown))
}

fn auto_reply(text: &str) -> Option<String> {
    let lowered = text.trim().to_lowercase();
    if lowered == "hello" || lowered == "hi" {
        Some("Hello! Send /help to see what I can do.".to_string())
    } else if lowered == "thanks" || lowered == "thank you" {
        Some("You're welcome!".to_string())
    } else {
        None
    }
}
