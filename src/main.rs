use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use chatvox::script::FileSettingsProvider;
use chatvox::{ChatEvent, Config, OutboundEvent, Processor, Session, Unconfigured};

const FEED_CAPACITY: usize = 64;

struct Channel {
    feed: mpsc::Sender<ChatEvent>,
    stop: oneshot::Sender<()>,
    session: Session,
}

#[tokio::main]
async fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    // Initialize logging
    if let Err(e) = chatvox::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        chatvox::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return;
    }

    info!("chatvox - script-driven chat event processor");
    info!(settings_dir = %config.script.settings_dir, "loading scripts");

    let settings = Arc::new(FileSettingsProvider::new(
        &config.script.settings_dir,
        config.script.default_limits(),
    ));
    let processor = Processor::new(
        config.script.clone(),
        settings,
        Arc::new(Unconfigured),
        Arc::new(Unconfigured),
    );

    // Each input line is `channel: viewer: message`; one session per channel.
    let mut channels: HashMap<String, Channel> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "failed to read stdin");
                        break;
                    }
                };
                let Some((channel, event)) = parse_line(&line) else {
                    warn!(line = %line, "expected `channel: viewer: message`");
                    continue;
                };
                let entry = channels
                    .entry(channel.clone())
                    .or_insert_with(|| open_channel(&processor, &channel));
                if entry.feed.send(event).await.is_err() {
                    warn!(channel = %channel, "session is no longer reading events");
                    channels.remove(&channel);
                }
            }
        }
    }

    for (name, channel) in channels {
        let _ = channel.stop.send(());
        drop(channel.feed);
        match channel.session.wait().await {
            Ok(status) => info!(channel = %name, ?status, "session finished"),
            Err(e) => error!(channel = %name, error = %e, "session failed"),
        }
    }
}

fn open_channel(processor: &Processor, channel: &str) -> Channel {
    let (feed, feed_rx) = mpsc::channel(FEED_CAPACITY);
    let (stop, stop_rx) = oneshot::channel();
    let name = channel.to_string();
    let sink = Arc::new(move |event: OutboundEvent| print_event(&name, &event));
    let session = processor.start(channel, feed_rx, sink, stop_rx);
    Channel {
        feed,
        stop,
        session,
    }
}

fn print_event(channel: &str, event: &OutboundEvent) {
    let line = serde_json::json!({
        "channel": channel,
        "kind": event.kind,
        "bytes": event.payload.len(),
        "text": String::from_utf8_lossy(&event.payload),
    });
    println!("{line}");
}

fn parse_line(line: &str) -> Option<(String, ChatEvent)> {
    let (channel, rest) = line.split_once(':')?;
    let (viewer, message) = rest.split_once(':')?;
    let channel = channel.trim();
    if channel.is_empty() {
        return None;
    }
    Some((
        channel.to_string(),
        ChatEvent::new(viewer.trim(), message.trim()),
    ))
}
