//! REST + server-sent-events binding of the realtime store.
//!
//! Writes are `PUT {endpoint}/{path}.json?auth=...`. A subscription is a
//! streaming `GET` with `Accept: text/event-stream`; its `put`/`patch` events
//! are folded into a local [`tree`](super::tree) and the full value is
//! forwarded after each one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StoreConnection, StoreConnector, Subscription, tree};
use crate::credentials::Credentials;
use crate::error::SwarmError;

const SUBSCRIPTION_CAPACITY: usize = 64;

/// Connector for the REST binding.
pub struct RestStore {
    client: reqwest::Client,
    /// When set, the issued token is exchanged here for an id token.
    auth_url: Option<String>,
}

impl RestStore {
    pub fn new(client: reqwest::Client, auth_url: Option<String>) -> Self {
        Self { client, auth_url }
    }

    async fn exchange_token(&self, auth_url: &str, token: &str) -> Result<String, SwarmError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TokenResponse {
            id_token: Option<String>,
        }

        let response = self
            .client
            .post(auth_url)
            .json(&json!({ "token": token, "returnSecureToken": true }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SwarmError::Auth(format!("token exchange failed: HTTP {status}")));
        }
        response
            .json::<TokenResponse>()
            .await?
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SwarmError::Auth("token exchange returned no id token".to_string()))
    }
}

#[async_trait]
impl StoreConnector for RestStore {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn StoreConnection>, SwarmError> {
        let auth = match &self.auth_url {
            Some(url) => self.exchange_token(url, &credentials.token).await?,
            None => credentials.token.clone(),
        };
        debug!(endpoint = %credentials.endpoint, "store connection authenticated");
        Ok(Arc::new(RestConnection {
            client: self.client.clone(),
            base: credentials.endpoint.trim_end_matches('/').to_string(),
            auth,
            cancel: CancellationToken::new(),
        }))
    }
}

struct RestConnection {
    client: reqwest::Client,
    base: String,
    auth: String,
    /// Parent of every subscription's token.
    cancel: CancellationToken,
}

impl RestConnection {
    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base, path.trim_matches('/'))
    }
}

#[async_trait]
impl StoreConnection for RestConnection {
    async fn set(&self, path: &str, value: Value) -> Result<(), SwarmError> {
        if self.cancel.is_cancelled() {
            return Err(SwarmError::Transport("connection closed".into()));
        }
        self.client
            .put(self.url(path))
            .query(&[("auth", &self.auth)])
            .json(&value)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, SwarmError> {
        if self.cancel.is_cancelled() {
            return Err(SwarmError::Transport("connection closed".into()));
        }
        let response = self
            .client
            .get(self.url(path))
            .query(&[("auth", &self.auth)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let cancel = self.cancel.child_token();
        let path = path.to_string();
        tokio::spawn(async move {
            pump_events(response, tx, cancel, &path).await;
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split events (and
/// UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() && event == "message" {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// What a single event did to the mirrored tree.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamStep {
    Updated,
    Ignored,
    Closed(String),
}

#[derive(Deserialize)]
struct ChangePayload {
    path: String,
    #[serde(default)]
    data: Value,
}

/// Apply one event to `tree`.
pub fn apply_event(tree: &mut Value, event: &SseEvent) -> StreamStep {
    match event.event.as_str() {
        "put" | "patch" => {
            let payload: ChangePayload = match serde_json::from_str(&event.data) {
                Ok(p) => p,
                Err(e) => {
                    warn!(event = %event.event, error = %e, "malformed change event");
                    return StreamStep::Ignored;
                }
            };
            if event.event == "put" {
                tree::put(tree, &payload.path, payload.data);
            } else {
                tree::patch(tree, &payload.path, payload.data);
            }
            StreamStep::Updated
        }
        "keep-alive" => StreamStep::Ignored,
        "cancel" | "auth_revoked" => StreamStep::Closed(event.event.clone()),
        other => {
            debug!(event = %other, "ignoring unknown event");
            StreamStep::Ignored
        }
    }
}

async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    path: &str,
) {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();
    let mut mirror = Value::Null;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(%path, error = %e, "subscription stream error");
                break;
            }
            None => {
                debug!(%path, "subscription stream ended");
                break;
            }
        };

        for event in parser.feed(&bytes) {
            match apply_event(&mut mirror, &event) {
                StreamStep::Updated => {
                    if tx.send(mirror.clone()).await.is_err() {
                        return;
                    }
                }
                StreamStep::Ignored => {}
                StreamStep::Closed(reason) => {
                    info!(%path, %reason, "subscription closed by store");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(server: &MockServer) -> Credentials {
        Credentials {
            token: "tok".into(),
            endpoint: format!("{}/", server.uri()),
        }
    }

    #[test]
    fn parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: put\ndata: {\"pa").is_empty());
        let events = parser.feed(b"th\":\"/\",\"data\":1}\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "put");
        assert_eq!(events[0].data, r#"{"path":"/","data":1}"#);
        assert_eq!(events[1].event, "keep-alive");
    }

    #[test]
    fn parser_strips_carriage_returns() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"event: cancel\r\ndata: null\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "cancel".into(),
                data: "null".into()
            }]
        );
    }

    #[test]
    fn apply_put_then_patch() {
        let mut mirror = Value::Null;
        let put = SseEvent {
            event: "put".into(),
            data: r#"{"path":"/","data":{"stg":"waiting","c":{"bob":{"b":"Cow"}}}}"#.into(),
        };
        assert_eq!(apply_event(&mut mirror, &put), StreamStep::Updated);

        let patch = SseEvent {
            event: "patch".into(),
            data: r#"{"path":"/c/bob","data":{"g":5}}"#.into(),
        };
        assert_eq!(apply_event(&mut mirror, &patch), StreamStep::Updated);
        assert_eq!(mirror["c"]["bob"]["g"], 5);
        assert_eq!(mirror["c"]["bob"]["b"], "Cow");
    }

    #[test]
    fn apply_revocation_closes() {
        let mut mirror = Value::Null;
        let revoked = SseEvent {
            event: "auth_revoked".into(),
            data: "null".into(),
        };
        assert_eq!(
            apply_event(&mut mirror, &revoked),
            StreamStep::Closed("auth_revoked".into())
        );
    }

    #[tokio::test]
    async fn set_puts_json_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/1234/c/bob.json"))
            .and(query_param("auth", "tok"))
            .and(body_json(json!({ "b": "Cow", "rt": true })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "b": "Cow", "rt": true })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(reqwest::Client::new(), None);
        let conn = store.connect(&credentials(&server)).await.unwrap();
        conn.set("1234/c/bob", json!({ "b": "Cow", "rt": true })).await.unwrap();
    }

    #[tokio::test]
    async fn set_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = RestStore::new(reqwest::Client::new(), None);
        let conn = store.connect(&credentials(&server)).await.unwrap();
        let err = conn.set("1234/c/bob", json!(1)).await.unwrap_err();
        assert!(matches!(err, SwarmError::Transport(_)));
    }

    #[tokio::test]
    async fn subscribe_streams_full_values() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: put\n",
            "data: {\"path\":\"/\",\"data\":{\"stg\":\"waiting\"}}\n\n",
            "event: keep-alive\n",
            "data: null\n\n",
            "event: patch\n",
            "data: {\"path\":\"/c\",\"data\":{\"bob\":{\"b\":\"Cow\"}}}\n\n",
        );
        Mock::given(method("GET"))
            .and(path("/1234.json"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let store = RestStore::new(reqwest::Client::new(), None);
        let conn = store.connect(&credentials(&server)).await.unwrap();
        let mut sub = conn.subscribe("1234").await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), json!({ "stg": "waiting" }));
        assert_eq!(
            sub.recv().await.unwrap(),
            json!({ "stg": "waiting", "c": { "bob": { "b": "Cow" } } })
        );
        // Body exhausted: the subscription closes
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_connection_refuses_writes() {
        let server = MockServer::start().await;
        let store = RestStore::new(reqwest::Client::new(), None);
        let conn = store.connect(&credentials(&server)).await.unwrap();
        conn.close().await;
        assert_eq!(
            conn.set("x", json!(1)).await.unwrap_err(),
            SwarmError::Transport("connection closed".into())
        );
    }

    #[tokio::test]
    async fn token_exchange_uses_id_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exchange"))
            .and(body_json(json!({ "token": "tok", "returnSecureToken": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "idToken": "id-1" })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/1234/c/bob.json"))
            .and(query_param("auth", "id-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(
            reqwest::Client::new(),
            Some(format!("{}/exchange", server.uri())),
        );
        let conn = store.connect(&credentials(&server)).await.unwrap();
        conn.set("1234/c/bob", Value::Null).await.unwrap();
    }

    #[tokio::test]
    async fn failed_token_exchange_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let store = RestStore::new(
            reqwest::Client::new(),
            Some(format!("{}/exchange", server.uri())),
        );
        let err = match store.connect(&credentials(&server)).await {
            Err(e) => e,
            Ok(_) => panic!("exchange should fail"),
        };
        assert!(matches!(err, SwarmError::Auth(_)));
    }
}
