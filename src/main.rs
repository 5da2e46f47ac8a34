use anyhow::{Context, Result};
use clawlink::{ClientEvent, GatewayClient, GatewayConfig, NotificationKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const ENV_PREFIX: &str = "CLAWLINK";

fn load_config() -> Result<GatewayConfig> {
    #[cfg(feature = "env-file")]
    let config = GatewayConfig::from_env_auto(ENV_PREFIX);
    #[cfg(not(feature = "env-file"))]
    let config = GatewayConfig::from_env(ENV_PREFIX);

    let mut config = config.context("invalid gateway configuration")?;
    if let Some(url) = std::env::args().nth(1) {
        config.url = url;
    }
    Ok(config)
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::MessageChunk { text, .. } => {
            print!("{}", text);
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        ClientEvent::MessageComplete(message) => {
            println!("\n[{}] {}", message.role, message.content);
        }
        ClientEvent::Notification(n) => {
            let tag = match n.kind {
                NotificationKind::Info => "info",
                NotificationKind::Success => "ok",
                NotificationKind::Warning => "warn",
                NotificationKind::Error => "error",
            };
            if n.message.is_empty() {
                println!("({}) {}", tag, n.title);
            } else {
                println!("({}) {}: {}", tag, n.title, n.message);
            }
        }
        ClientEvent::ConnectionChanged(state) => println!("-- {}", state),
        ClientEvent::ApprovalRequested(approval) => {
            println!(
                "?? approval {} for {} {}  (/approve {} or /deny {})",
                approval.id, approval.tool, approval.args, approval.id, approval.id
            );
        }
        ClientEvent::StatusChanged(_) => {}
    }
}

fn handle_line(client: &GatewayClient, line: &str) -> bool {
    let mut parts = line.splitn(2, ' ');
    let outcome = match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
        ("/quit" | "/exit", _) => return false,
        ("/abort", _) => client.cancel_current(),
        ("/approve", Some(id)) => client.respond_approval(id, true),
        ("/deny", Some(id)) => client.respond_approval(id, false),
        ("/runs", _) => client.refresh_runs(),
        ("/cron", _) => client.refresh_cron(),
        ("/reconnect", _) => client.force_reconnect(),
        ("/status", _) => {
            let status = client.status();
            println!(
                "state={} model={} task={} tokens={}/{} cost={:.4} runs={} cron={}",
                client.state(),
                status.model,
                status.current_task,
                status.tokens_in,
                status.tokens_out,
                status.cost,
                client.runs().len(),
                client.cron().len()
            );
            Ok(())
        }
        (cmd, _) if cmd.starts_with('/') => {
            println!("commands: /abort /approve <id> /deny <id> /runs /cron /reconnect /status /quit");
            Ok(())
        }
        _ => client.send_message(line),
    };
    if let Err(e) = outcome {
        println!("(error) {}", e);
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clawlink=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    let (events_tx, mut events) = mpsc::unbounded_channel::<ClientEvent>();
    let client = GatewayClient::new(config, Arc::new(events_tx))
        .context("failed to initialise device identity")?;
    println!("device {}", client.device_id());
    client.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(event),
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if !handle_line(&client, line.trim()) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tokio::task::spawn_blocking(move || client.stop()).await?;
    Ok(())
}
