use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use claws_core::{
    roster::{
        agent_id_from_session_key, find_agent, fleet_presence, parse_session_list, AgentPresence,
        Session,
    },
    wire::CHALLENGE_EVENT,
    ConnectionStatus, Envelope, StreamEvent,
};
use claws_gateway::GatewayClient;
use serde_json::{json, Value};
use std::{
    io::{self, Write},
    time::Duration,
};
use tokio::time::MissedTickBehavior;
use tracing::debug;

const DEFAULT_POLL_SECS: u64 = 15;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between fleet presence polls
    #[arg(long, default_value_t = DEFAULT_POLL_SECS)]
    pub poll_interval: u64,
}

impl Default for WatchArgs {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_SECS,
        }
    }
}

pub async fn watch(client: GatewayClient, args: WatchArgs) -> Result<()> {
    let (mut events, subscription) = client.events();
    client.connect();

    let mut poll = tokio::time::interval(Duration::from_secs(args.poll_interval.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => {
                let Some(envelope) = event else { break };
                if let Some(status) = envelope.connection_status() {
                    println!("[{}] gateway {status}", clock());
                    if status == ConnectionStatus::Connected {
                        refresh_presence(&client).await;
                    }
                    continue;
                }
                match StreamEvent::from_envelope(&envelope) {
                    Some(StreamEvent::Delta { fragment, .. }) => {
                        print!("{fragment}");
                        io::stdout().flush()?;
                    }
                    Some(StreamEvent::Done { .. }) => println!(),
                    None => {
                        if let Some(line) = describe_event(&envelope) {
                            println!("[{}] {line}", clock());
                        }
                    }
                }
            }
            _ = poll.tick() => {
                if client.is_connected() {
                    refresh_presence(&client).await;
                }
            }
        }
    }

    subscription.unsubscribe();
    client.disconnect();
    Ok(())
}

pub async fn sessions(client: &GatewayClient) -> Result<()> {
    let payload = client
        .request("sessions.list", json!({}))
        .await
        .context("sessions.list failed")?;
    let sessions = parse_session_list(&payload);
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for session in &sessions {
        println!("{}", format_session(session));
    }
    Ok(())
}

pub async fn status(client: GatewayClient, ready_timeout: Duration) -> Result<()> {
    client.connect();
    let reachable = match client.wait_until_ready(ready_timeout).await {
        Ok(()) => client.request("status", json!({})).await.is_ok(),
        Err(err) => {
            debug!("status_not_ready: {err}");
            false
        }
    };
    client.disconnect();
    if reachable {
        println!("gateway is running and connected");
    } else {
        println!("gateway unreachable");
    }
    Ok(())
}

/// Polling failures are expected while the gateway restarts, so they are
/// only logged.
async fn refresh_presence(client: &GatewayClient) {
    match client.request("sessions.list", json!({})).await {
        Ok(payload) => {
            let sessions = parse_session_list(&payload);
            for presence in fleet_presence(&sessions) {
                println!("  {}", format_presence(&presence));
            }
        }
        Err(err) => debug!("presence_poll_failed: {err}"),
    }
}

fn describe_event(envelope: &Envelope) -> Option<String> {
    match envelope {
        Envelope::Event(frame) if frame.event == CHALLENGE_EVENT => None,
        Envelope::Event(frame) => Some(format!("event {}", frame.event)),
        Envelope::Req(frame) => Some(format!("request {}", frame.method)),
        Envelope::Res(_) => None,
    }
}

pub fn format_presence(presence: &AgentPresence) -> String {
    let state = if presence.online { "online" } else { "offline" };
    let plural = if presence.active_sessions == 1 { "" } else { "s" };
    format!(
        "{} {:<10} {:<7} {} active session{plural}",
        presence.profile.emoji, presence.profile.name, state, presence.active_sessions
    )
}

pub fn format_session(session: &Session) -> String {
    let kind = if session.kind.is_empty() {
        "-"
    } else {
        session.kind.as_str()
    };
    let activity = match &session.last_activity {
        Value::Null => "-".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let agent = agent_id_from_session_key(&session.key)
        .and_then(find_agent)
        .map(|profile| profile.name)
        .unwrap_or("-");
    match session.channel.as_deref() {
        Some(channel) => format!(
            "{:<28} {agent:<10} {kind:<8} {activity}  via {channel}",
            session.key
        ),
        None => format!("{:<28} {agent:<10} {kind:<8} {activity}", session.key),
    }
}

fn clock() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
