//! Chat sub-channel: an encrypted websocket stream beside the store sessions.
//!
//! Frames are JSON, optionally wrapped in an envelope. The background task
//! reconnects on close with capped exponential backoff until shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use swarm_envelope::{Envelope, Sealer};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::SwarmError;
use crate::storage::SecureStorage;

const OUTGOING_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 128;

const BAN_KEY: &str = "chat_banned";
const BAN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSource {
    Local,
    Discord,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub source: ChatSource,
    pub author: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Connected,
    Disconnected,
    Message(ChatMessage),
    /// Backlog, oldest first.
    History { messages: Vec<ChatMessage> },
    Error { message: String },
    Banned,
}

#[derive(Deserialize)]
struct Sender {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    src: Option<ChatSource>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sender: Option<Sender>,
    #[serde(default)]
    content: String,
}

impl HistoryEntry {
    fn into_message(self, default_source: ChatSource) -> ChatMessage {
        let author = self
            .sender
            .map(|s| s.name)
            .filter(|n| !n.is_empty())
            .or(self.name)
            .unwrap_or_default();
        ChatMessage {
            source: self.src.unwrap_or(default_source),
            author,
            content: self.content,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Msg(HistoryEntry),
    History {
        #[serde(default)]
        messages: Vec<HistoryEntry>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
}

/// Decode one incoming text frame. Unknown or unparsable frames yield nothing.
pub fn parse_frame(sealer: &Sealer, text: &str) -> Vec<ChatEvent> {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        debug!("ignoring non-JSON chat frame");
        return Vec::new();
    };
    let body = match Envelope::recognize(&parsed) {
        Some(envelope) => match sealer.open_json::<Value>(&envelope) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(error = %e, "chat envelope did not open, reading it as plaintext");
                parsed
            }
        },
        None => parsed,
    };

    let frame = match serde_json::from_value::<Frame>(body) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ignoring chat frame");
            return Vec::new();
        }
    };

    match frame {
        Frame::Msg(entry) => {
            let message = entry.into_message(ChatSource::Local);
            let banned =
                message.source == ChatSource::System && message.content.contains("banned");
            let mut events = vec![ChatEvent::Message(message)];
            if banned {
                events.push(ChatEvent::Banned);
            }
            events
        }
        Frame::History { messages } => {
            // Newest first on the wire
            let messages = messages
                .into_iter()
                .rev()
                .map(|e| e.into_message(ChatSource::Discord))
                .collect();
            vec![ChatEvent::History { messages }]
        }
        Frame::Error { message, content } => vec![ChatEvent::Error {
            message: message
                .or(content)
                .unwrap_or_else(|| "unknown chat error".to_string()),
        }],
    }
}

struct ChannelState {
    connected: AtomicBool,
    banned: AtomicBool,
    events: broadcast::Sender<ChatEvent>,
    storage: Option<Arc<SecureStorage>>,
}

impl ChannelState {
    fn new(storage: Option<Arc<SecureStorage>>) -> Self {
        let banned = storage
            .as_ref()
            .and_then(|s| s.get::<bool>(BAN_KEY))
            .unwrap_or(false);
        if banned {
            info!("chat ban from an earlier run is still in effect");
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connected: AtomicBool::new(false),
            banned: AtomicBool::new(banned),
            events,
            storage,
        }
    }

    fn emit(&self, event: ChatEvent) {
        if event == ChatEvent::Banned && !self.banned.swap(true, Ordering::AcqRel) {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.set_for(BAN_KEY, &true, BAN_TTL) {
                    warn!(error = %e, "failed to persist chat ban");
                }
            }
        }
        let _ = self.events.send(event);
    }
}

/// Handle to the chat background task. Dropping the handle stops the task;
/// [`ChatChannel::shutdown`] also waits for it to exit.
pub struct ChatChannel {
    sealer: Sealer,
    state: Arc<ChannelState>,
    outgoing: mpsc::Sender<String>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ChatChannel {
    /// Start the background task. With `storage`, a ban survives restarts for
    /// thirty days.
    pub fn spawn(
        url: &str,
        sealer: Sealer,
        policy: ReconnectPolicy,
        storage: Option<Arc<SecureStorage>>,
    ) -> Self {
        let state = Arc::new(ChannelState::new(storage));
        let (outgoing, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            url.to_string(),
            sealer.clone(),
            policy,
            state.clone(),
            rx,
            cancel.clone(),
        ));

        Self {
            sealer,
            state,
            outgoing,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.state.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn is_banned(&self) -> bool {
        self.state.banned.load(Ordering::Acquire)
    }

    /// Seal and queue a user message.
    pub async fn send(&self, name: &str, content: &str) -> Result<(), SwarmError> {
        if self.is_banned() {
            return Err(SwarmError::Banned);
        }
        if !self.is_connected() {
            return Err(SwarmError::ChatUnavailable);
        }
        let envelope = self.sealer.seal_json(&json!({
            "type": "msg",
            "name": format!("[{name}]:"),
            "content": content,
        }))?;
        self.outgoing
            .send(envelope.to_json().to_string())
            .await
            .map_err(|_| SwarmError::ChatUnavailable)
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    url: String,
    sealer: Sealer,
    policy: ReconnectPolicy,
    state: Arc<ChannelState>,
    mut outgoing: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                info!(%url, "chat connected");
                state.connected.store(true, Ordering::Release);
                state.emit(ChatEvent::Connected);

                let closed = pump(ws, &sealer, &state, &mut outgoing, &cancel).await;

                state.connected.store(false, Ordering::Release);
                state.emit(ChatEvent::Disconnected);
                if let Err(e) = closed {
                    warn!(%url, error = %e, "chat connection lost");
                }
            }
            Err(e) => warn!(%url, attempt, error = %e, "chat connect failed"),
        }

        if cancel.is_cancelled() {
            break;
        }
        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(%url, "chat reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(%url, "chat task exiting");
}

type ChatSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    ws: ChatSocket,
    sealer: &Sealer,
    state: &ChannelState,
    outgoing: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> Result<(), SwarmError> {
    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                return Ok(());
            }

            Some(frame) = outgoing.recv() => {
                ws_write.send(tungstenite::Message::Text(frame.into())).await?;
            }

            msg = ws_read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    for event in parse_frame(sealer, &text) {
                        state.emit(event);
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn local(author: &str, content: &str) -> ChatMessage {
        ChatMessage {
            source: ChatSource::Local,
            author: author.into(),
            content: content.into(),
        }
    }

    #[test]
    fn plaintext_message_frame() {
        let events = parse_frame(
            &Sealer::default(),
            r#"{"type":"msg","src":"local","name":"[bob]:","content":"hi"}"#,
        );
        assert_eq!(events, vec![ChatEvent::Message(local("[bob]:", "hi"))]);
    }

    #[test]
    fn sealed_message_frame() {
        let sealer = Sealer::default();
        let envelope = sealer
            .seal_json(&json!({
                "type": "msg",
                "src": "discord",
                "sender": { "name": "alice", "avatar": "https://example.invalid/a.png" },
                "content": "hello"
            }))
            .unwrap();
        let events = parse_frame(&sealer, &envelope.to_json().to_string());
        assert_eq!(
            events,
            vec![ChatEvent::Message(ChatMessage {
                source: ChatSource::Discord,
                author: "alice".into(),
                content: "hello".into(),
            })]
        );
    }

    #[test]
    fn history_is_delivered_oldest_first() {
        let events = parse_frame(
            &Sealer::default(),
            r#"{"type":"history","messages":[
                {"sender":{"name":"b"},"content":"second"},
                {"sender":{"name":"a"},"content":"first"}
            ]}"#,
        );
        let ChatEvent::History { messages } = &events[0] else {
            panic!("expected history, got {events:?}");
        };
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert_eq!(messages[0].source, ChatSource::Discord);
    }

    #[test]
    fn system_ban_notice_sets_flag_event() {
        let events = parse_frame(
            &Sealer::default(),
            r#"{"type":"msg","src":"system","name":"mod","content":"you have been banned"}"#,
        );
        assert_eq!(events.last(), Some(&ChatEvent::Banned));
    }

    #[test]
    fn error_and_garbage_frames() {
        let sealer = Sealer::default();
        assert_eq!(
            parse_frame(&sealer, r#"{"type":"error","message":"slow down"}"#),
            vec![ChatEvent::Error {
                message: "slow down".into()
            }]
        );
        assert!(parse_frame(&sealer, "not json").is_empty());
        assert!(parse_frame(&sealer, r#"{"type":"typing"}"#).is_empty());
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn send_reaches_server_sealed_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, mut received_rx) = mpsc::channel::<String>(4);

        tokio::spawn(async move {
            // First connection: read one frame, then hang up
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(tungstenite::Message::Text(
                r#"{"type":"msg","src":"system","name":"bot","content":"welcome"}"#
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
            if let Some(Ok(tungstenite::Message::Text(text))) = ws.next().await {
                received_tx.send(text.to_string()).await.unwrap();
            }
            drop(ws);

            // Second connection stays open
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let policy = ReconnectPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        let chat = ChatChannel::spawn(&url, Sealer::default(), policy, None);
        let mut rx = chat.subscribe();

        assert_eq!(next_event(&mut rx).await, ChatEvent::Connected);
        assert_eq!(
            next_event(&mut rx).await,
            ChatEvent::Message(ChatMessage {
                source: ChatSource::System,
                author: "bot".into(),
                content: "welcome".into(),
            })
        );

        chat.send("bob", "hi all").await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        let envelope = Envelope::recognize(&parsed).expect("outgoing frames are sealed");
        let body: Value = Sealer::default().open_json(&envelope).unwrap();
        assert_eq!(body, json!({ "type": "msg", "name": "[bob]:", "content": "hi all" }));

        assert_eq!(next_event(&mut rx).await, ChatEvent::Disconnected);
        assert_eq!(next_event(&mut rx).await, ChatEvent::Connected);
        assert!(chat.is_connected());

        chat.shutdown().await;
    }

    #[tokio::test]
    async fn send_while_disconnected_is_refused() {
        // Nothing listens on this port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let chat = ChatChannel::spawn(&url, Sealer::default(), ReconnectPolicy::default(), None);
        assert_eq!(
            chat.send("bob", "hello?").await.unwrap_err(),
            SwarmError::ChatUnavailable
        );
        chat.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_handle_stops_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        // Hang up on every connection before the handshake
        tokio::spawn({
            let accepts = accepts.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepts.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let policy = ReconnectPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(5),
        };
        let chat = ChatChannel::spawn(&url, Sealer::default(), policy, None);
        tokio::time::timeout(Duration::from_secs(5), async {
            while accepts.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(chat);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_drop = accepts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn ban_is_persisted_and_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(SecureStorage::open(tmp.path(), Sealer::default()).unwrap());

        let state = ChannelState::new(Some(storage.clone()));
        assert!(!state.banned.load(Ordering::Acquire));
        for event in parse_frame(
            &Sealer::default(),
            r#"{"type":"msg","src":"system","name":"mod","content":"you have been banned"}"#,
        ) {
            state.emit(event);
        }
        assert!(state.banned.load(Ordering::Acquire));
        assert_eq!(storage.get::<bool>(BAN_KEY), Some(true));

        // A later run starts banned and refuses to send
        let reopened = Arc::new(SecureStorage::open(tmp.path(), Sealer::default()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        let chat = ChatChannel::spawn(
            &url,
            Sealer::default(),
            ReconnectPolicy::default(),
            Some(reopened),
        );
        assert!(chat.is_banned());
        assert_eq!(
            chat.send("bob", "hello?").await.unwrap_err(),
            SwarmError::Banned
        );
        chat.shutdown().await;
    }
}
