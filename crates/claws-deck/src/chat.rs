use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Args;
use claws_core::{
    roster::{find_agent, AgentProfile},
    ChatMessage,
};
use claws_gateway::{GatewayClient, StreamReassembler};
use serde_json::{json, Value};
use std::{
    future::Future,
    io::{self, Write},
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHECK_MEMORY_PROMPT: &str = "read MEMORY.md";
const DEFAULT_REPLY_WAIT_SECS: u64 = 120;

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Agent id or display name (main, trib, reef)
    #[arg(long)]
    pub agent: String,
    /// Seconds to keep streaming the reply before aborting it
    #[arg(long, default_value_t = DEFAULT_REPLY_WAIT_SECS)]
    pub wait: u64,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub target: AgentArgs,
    #[arg(required = true, trailing_var_arg = true)]
    pub message: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AbortArgs {
    /// Agent id or display name (main, trib, reef)
    #[arg(long)]
    pub agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    TimedOut,
    Interrupted,
    Closed,
}

/// `dk-<unix-millis>-<uuid>`, unique per send so the gateway can drop retries.
pub fn idempotency_key() -> String {
    format!("dk-{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4())
}

pub fn chat_send_params(message: &str, session_key: &str) -> Value {
    json!({
        "message": message,
        "idempotencyKey": idempotency_key(),
        "sessionKey": session_key,
    })
}

pub fn chat_abort_params(session_key: &str) -> Value {
    json!({ "sessionKey": session_key })
}

fn profile_for(agent: &str) -> Result<&'static AgentProfile> {
    find_agent(agent).ok_or_else(|| anyhow!("unknown agent: {agent}"))
}

/// Asks the gateway to stop generating on `session_key`. Failures are only
/// logged; the stream is abandoned locally either way.
pub async fn abort(client: &GatewayClient, session_key: &str) {
    match client
        .request("chat.abort", chat_abort_params(session_key))
        .await
    {
        Ok(_) => info!("chat_abort: session={session_key}"),
        Err(err) => debug!("chat_abort_failed: session={session_key} {err}"),
    }
}

pub async fn abort_agent(client: &GatewayClient, args: &AbortArgs) -> Result<()> {
    let profile = profile_for(&args.agent)?;
    abort(client, profile.session_key).await;
    println!("Abort sent to {} {}", profile.emoji, profile.name);
    Ok(())
}

pub async fn send(client: &GatewayClient, args: &AgentArgs, message: &str) -> Result<ChatMessage> {
    send_until(client, args, message, tokio::signal::ctrl_c()).await
}

/// Sends `message` and streams the reply until it completes, `args.wait`
/// elapses, or `interrupt` resolves. The last two abort the stream.
async fn send_until<I>(
    client: &GatewayClient,
    args: &AgentArgs,
    message: &str,
    interrupt: I,
) -> Result<ChatMessage>
where
    I: Future,
{
    let profile = profile_for(&args.agent)?;

    // Reassembler first, so a frame is applied before it reaches `events`.
    let reassembler = StreamReassembler::new();
    let stream_sub = reassembler.attach(client);
    let (mut events, events_sub) = client.events();

    let reply_id = reassembler.begin_exchange(profile.session_key, message);
    println!("{} {} > {message}", profile.emoji, profile.name);
    info!("chat_send: agent={} session={}", profile.id, profile.session_key);

    if let Err(err) = client
        .request("chat.send", chat_send_params(message, profile.session_key))
        .await
    {
        warn!("chat_send_error: {err}");
        reassembler.update_message(&reply_id, &format!("Error: {err}"), true);
    }

    let mut shown = String::new();
    let deadline = tokio::time::sleep(Duration::from_secs(args.wait));
    tokio::pin!(deadline);
    tokio::pin!(interrupt);
    let mut end = StreamEnd::Finished;
    while reassembler.is_streaming(&reply_id) {
        tokio::select! {
            _ = &mut interrupt => {
                end = StreamEnd::Interrupted;
                break;
            }
            _ = &mut deadline => {
                warn!("chat_reply_wait_elapsed: agent={}", profile.id);
                end = StreamEnd::TimedOut;
                break;
            }
            event = events.recv() => {
                if event.is_none() {
                    end = StreamEnd::Closed;
                    break;
                }
                print_progress(&mut shown, &reply_content(&reassembler, &reply_id))?;
            }
        }
    }

    if matches!(end, StreamEnd::TimedOut | StreamEnd::Interrupted) {
        abort(client, profile.session_key).await;
        let partial = reply_content(&reassembler, &reply_id);
        reassembler.update_message(&reply_id, &partial, true);
    }
    print_progress(&mut shown, &reply_content(&reassembler, &reply_id))?;
    println!();

    stream_sub.unsubscribe();
    events_sub.unsubscribe();
    reassembler
        .find(&reply_id)
        .ok_or_else(|| anyhow!("reply {reply_id} vanished from history"))
}

fn reply_content(reassembler: &StreamReassembler, reply_id: &str) -> String {
    reassembler
        .find(reply_id)
        .map(|reply| reply.content)
        .unwrap_or_default()
}

/// Prints whatever part of `content` has not been shown yet. A reply that
/// was replaced rather than extended is printed again on a fresh line.
fn print_progress(shown: &mut String, content: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match content.strip_prefix(shown.as_str()) {
        Some(rest) if !rest.is_empty() => write!(stdout, "{rest}")?,
        Some(_) => {}
        None => {
            writeln!(stdout)?;
            write!(stdout, "{content}")?;
        }
    }
    stdout.flush()?;
    *shown = content.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use claws_core::{
        wire::{self, CHALLENGE_EVENT},
        Envelope, RequestFrame, ResponseFrame,
    };
    use claws_gateway::{
        Connector, GatewayConfig, MemorySettings, StoredSettings, Transport, TransportError,
        TransportEvent,
    };
    use futures_util::future::BoxFuture;
    use serde_json::Map;
    use std::future::pending;
    use tokio::sync::{mpsc, oneshot};
    use url::Url;

    struct Link {
        frames: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl Link {
        fn push(&self, envelope: Envelope) {
            let _ = self
                .events
                .send(TransportEvent::Text(wire::encode(&envelope).unwrap()));
        }

        fn reply(&self, id: &str, ok: bool) {
            self.push(Envelope::Res(ResponseFrame {
                id: id.to_string(),
                ok,
                payload: Some(json!({})),
                error: None,
                extra: Map::new(),
            }));
        }

        async fn next_request(&mut self) -> RequestFrame {
            let text = self.frames.recv().await.expect("client frame");
            match wire::decode(&text).unwrap() {
                Envelope::Req(frame) => frame,
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    struct LoopbackConnector {
        links: mpsc::UnboundedSender<Link>,
    }

    impl Connector for LoopbackConnector {
        fn connect(&self, _url: Url) -> BoxFuture<'static, Result<Transport, TransportError>> {
            let (transport, frames, events) = Transport::pair();
            let _ = self.links.send(Link { frames, events });
            Box::pin(async move { Ok(transport) })
        }
    }

    async fn ready_client() -> (GatewayClient, Link) {
        let (links_tx, mut links) = mpsc::unbounded_channel();
        let settings = MemorySettings::new(StoredSettings {
            ws_url: Some("ws://deck.test:18789".to_string()),
            token: Some("deck-token".to_string()),
        });
        let client = GatewayClient::with_connector(
            GatewayConfig::default(),
            settings,
            LoopbackConnector { links: links_tx },
        );
        client.connect();
        let mut link = links.recv().await.expect("link");
        link.push(Envelope::event(CHALLENGE_EVENT, json!({})));
        let auth = link.next_request().await;
        link.reply(&auth.id, true);
        client
            .wait_until_ready(Duration::from_secs(5))
            .await
            .expect("ready");
        (client, link)
    }

    fn reef(wait: u64) -> AgentArgs {
        AgentArgs {
            agent: "reef".to_string(),
            wait,
        }
    }

    #[test]
    fn idempotency_keys_are_unique_and_prefixed() {
        let a = idempotency_key();
        let b = idempotency_key();
        assert!(a.starts_with("dk-"));
        assert_ne!(a, b);
        assert_eq!(a.matches('-').count(), 6);
    }

    #[test]
    fn send_params_target_the_agent_session() {
        let params = chat_send_params("read MEMORY.md", "agent:trib:main");
        assert_eq!(params["message"], json!("read MEMORY.md"));
        assert_eq!(params["sessionKey"], json!("agent:trib:main"));
        assert!(params["idempotencyKey"]
            .as_str()
            .is_some_and(|key| key.starts_with("dk-")));
    }

    #[test]
    fn replaced_reply_is_reprinted_and_tracked() {
        let mut shown = String::new();
        print_progress(&mut shown, "Hel").unwrap();
        print_progress(&mut shown, "Hello").unwrap();
        assert_eq!(shown, "Hello");

        print_progress(&mut shown, "Error: connection closed").unwrap();
        assert_eq!(shown, "Error: connection closed");

        print_progress(&mut shown, "Error: connection closed").unwrap();
        assert_eq!(shown, "Error: connection closed");
    }

    #[tokio::test]
    async fn abort_targets_the_agent_session() {
        let (client, mut link) = ready_client().await;
        let args = AbortArgs {
            agent: "Reef".to_string(),
        };
        let call = tokio::spawn({
            let client = client.clone();
            async move { abort_agent(&client, &args).await }
        });

        let frame = link.next_request().await;
        assert_eq!(frame.method, "chat.abort");
        assert_eq!(frame.params, json!({"sessionKey": "agent:reef:main"}));
        link.reply(&frame.id, false);
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_wait_aborts_and_freezes_partial_reply() {
        let (client, mut link) = ready_client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { send_until(&client, &reef(5), "deploy", pending::<()>()).await }
        });

        let sent = link.next_request().await;
        assert_eq!(sent.method, "chat.send");
        link.reply(&sent.id, true);
        link.push(Envelope::event("chat.delta", json!({"text": "Deploying"})));

        let abort_frame = link.next_request().await;
        assert_eq!(abort_frame.method, "chat.abort");
        assert_eq!(abort_frame.params, json!({"sessionKey": "agent:reef:main"}));
        link.reply(&abort_frame.id, true);

        let reply = call.await.unwrap().expect("reply");
        assert_eq!(reply.content, "Deploying");
        assert!(!reply.streaming);
    }

    #[tokio::test]
    async fn interrupt_aborts_even_when_abort_is_refused() {
        let (client, mut link) = ready_client().await;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let call = tokio::spawn({
            let client = client.clone();
            async move { send_until(&client, &reef(120), "status", stop_rx).await }
        });

        let sent = link.next_request().await;
        link.reply(&sent.id, true);
        link.push(Envelope::event("chat.delta", json!({"text": "Check"})));
        stop_tx.send(()).unwrap();

        let abort_frame = link.next_request().await;
        assert_eq!(abort_frame.method, "chat.abort");
        link.reply(&abort_frame.id, false);

        let reply = call.await.unwrap().expect("reply");
        assert!(!reply.streaming);
        assert!(reply.content.starts_with("Check") || reply.content.is_empty());
    }

    #[tokio::test]
    async fn completed_stream_sends_no_abort() {
        let (client, mut link) = ready_client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { send_until(&client, &reef(120), "hi", pending::<()>()).await }
        });

        let sent = link.next_request().await;
        link.push(Envelope::event("chat.delta", json!({"text": "Hel"})));
        link.push(Envelope::event("chat.delta", json!({"chunk": "lo"})));
        link.push(Envelope::event("chat.done", json!({})));
        link.reply(&sent.id, true);

        let reply = call.await.unwrap().expect("reply");
        assert_eq!(reply.content, "Hello");
        assert!(!reply.streaming);
        assert!(link.frames.try_recv().is_err());
    }
}
