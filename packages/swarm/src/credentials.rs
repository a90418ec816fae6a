//! Credential acquisition over the sealed request/response exchange.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use swarm_envelope::{Envelope, Sealer};
use tracing::{debug, warn};

use crate::error::SwarmError;

/// Advertised alongside sealed request bodies.
pub const ENCRYPTION_HEADER: &str = "X-Encrypted";
const ENCRYPTION_SCHEME: &str = "ChaCha20-Poly1305";

/// Session credentials issued by the credential service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    /// Shard endpoint of the realtime store.
    pub endpoint: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
struct JoinResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "fbToken")]
    token: Option<String>,
    #[serde(default, alias = "fbShardURL")]
    endpoint: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// Issues credentials for `(group, display name)` pairs.
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn acquire(&self, group_id: &str, name: &str) -> Result<Credentials, SwarmError>;
}

/// Seal `body`, POST it to `url`, and unseal the response when it is an envelope.
///
/// A response that is not a recognized envelope (or whose envelope fails to
/// open) is passed through as parsed JSON: not every endpoint seals.
pub async fn exchange<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    sealer: &Sealer,
    url: &str,
    body: &T,
) -> Result<Value, SwarmError> {
    let envelope = sealer.seal_json(body)?;

    let response = client
        .post(url)
        .header(ENCRYPTION_HEADER, ENCRYPTION_SCHEME)
        .json(&envelope)
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;

    let parsed: Value = serde_json::from_str(&text).map_err(|e| {
        SwarmError::Transport(format!("HTTP {status}: response is not JSON ({e})"))
    })?;

    let Some(sealed) = Envelope::recognize(&parsed) else {
        debug!(%url, "plaintext response");
        return Ok(parsed);
    };

    match sealer.open_json::<Value>(&sealed) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!(%url, error = %e, "sealed response did not open, passing it through");
            Ok(parsed)
        }
    }
}

/// Interpret a credential service response body.
pub fn parse_credentials(body: Value) -> Result<Credentials, SwarmError> {
    let response: JoinResponse = serde_json::from_value(body)
        .map_err(|e| SwarmError::Transport(format!("unexpected credential response: {e}")))?;

    if !response.success {
        return Err(SwarmError::Auth(
            response
                .msg
                .unwrap_or_else(|| "rejected without a reason".to_string()),
        ));
    }

    match (response.token, response.endpoint) {
        (Some(token), Some(endpoint)) if !token.is_empty() && !endpoint.is_empty() => {
            Ok(Credentials { token, endpoint })
        }
        _ => Err(SwarmError::Transport(
            "credential response is missing token or endpoint".to_string(),
        )),
    }
}

/// The HTTP credential service: one sealed POST per acquisition.
pub struct HttpCredentialService {
    client: reqwest::Client,
    sealer: Sealer,
    join_url: String,
}

impl HttpCredentialService {
    pub fn new(client: reqwest::Client, sealer: Sealer, base_url: &str, join_path: &str) -> Self {
        let join_url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            join_path.trim_start_matches('/')
        );
        Self {
            client,
            sealer,
            join_url,
        }
    }

    pub fn join_url(&self) -> &str {
        &self.join_url
    }
}

#[async_trait]
impl CredentialService for HttpCredentialService {
    async fn acquire(&self, group_id: &str, name: &str) -> Result<Credentials, SwarmError> {
        let body = exchange(
            &self.client,
            &self.sealer,
            &self.join_url,
            &JoinRequest { id: group_id, name },
        )
        .await?;
        parse_credentials(body)
    }
}
