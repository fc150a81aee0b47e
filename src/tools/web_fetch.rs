//! `web_fetch`: SafeFetch-backed HTTP GET that follows redirects only
//! while every hop keeps resolving to a public address pinned against
//! the previous hop, connects to that pinned address directly (sending
//! the original hostname as `Host`/SNI so certificate validation still
//! matches the name), and wraps fetched content so a downstream model
//! never confuses it for trusted instructions.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{CoreError, Result};
use crate::safefetch::SafeFetch;
use crate::tools::{Tool, ToolIntent, ToolOutcome};

const UNTRUSTED_START: &str = "[UNTRUSTED_EXTERNAL_CONTENT_START]";
const UNTRUSTED_END: &str = "[UNTRUSTED_EXTERNAL_CONTENT_END]";

/// Content-type prefixes/exact values this tool will render as text. A
/// hop whose response doesn't match is rejected rather than silently
/// decoded, so a binary or unexpected payload never reaches the model.
const ALLOWED_CONTENT_TYPES: &[&str] = &["text/", "application/json", "application/xml", "application/xhtml+xml"];

#[derive(Debug, Deserialize)]
struct WebFetchArgs {
    url: String,
}

pub struct WebFetchTool {
    pub safe_fetch: Arc<SafeFetch>,
}

use std::sync::Arc;

impl WebFetchTool {
    pub fn new(safe_fetch: Arc<SafeFetch>) -> Result<Self> {
        Ok(Self { safe_fetch })
    }

    fn parse(args: &Value) -> Result<WebFetchArgs> {
        serde_json::from_value(args.clone()).map_err(|e| CoreError::ToolSchemaInvalid(e.to_string()))
    }

    /// A client pinned to `addr` for this hop's host: DNS resolution for
    /// `host` is overridden to the address SafeFetch already validated,
    /// so the TCP connect can never land anywhere SafeFetch didn't
    /// approve, while `Host`/SNI still carry the original hostname.
    fn pinned_client(&self, host: &str, addr: SocketAddr) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.safe_fetch.connect_timeout())
            .timeout(Duration::from_secs(30))
            .resolve(host, addr)
            .build()
            .map_err(|e| CoreError::AdapterTransport(e.to_string()))
    }

    fn content_type_allowed(content_type: &str) -> bool {
        let base = content_type.split(';').next().unwrap_or("").trim();
        ALLOWED_CONTENT_TYPES.iter().any(|allowed| {
            if let Some(prefix) = allowed.strip_suffix('/') {
                base.starts_with(&format!("{prefix}/"))
            } else {
                base == *allowed
            }
        })
    }
}

fn schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        serde_json::json!({
            "type": "object",
            "properties": { "url": { "type": "string", "minLength": 1 } },
            "required": ["url"],
        })
    })
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &'static str {
        "web_fetch"
    }

    fn json_schema(&self) -> &Value {
        schema()
    }

    fn classify_intent(&self, _args: &Value) -> ToolIntent {
        ToolIntent::NetworkImpacting
    }

    fn is_hard_denied(&self, args: &Value) -> Option<String> {
        let parsed = Self::parse(args).ok()?;
        let url = Url::parse(&parsed.url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Some(format!("unsupported scheme: {}", url.scheme()));
        }
        None
    }

    /// Matches the rule table's `web_fetch → net.fetch` row directly,
    /// independent of `exec`'s more granular intent gating.
    fn approval_gates(&self, _args: &Value) -> Vec<(String, Vec<String>)> {
        vec![("net-fetch".to_string(), vec!["net.fetch".to_string()])]
    }

    async fn execute(&self, args: &Value) -> Result<ToolOutcome> {
        let parsed = Self::parse(args)?;
        let mut url = Url::parse(&parsed.url).map_err(|e| CoreError::ToolSchemaInvalid(e.to_string()))?;

        let mut hop = self.safe_fetch.resolve_and_pin(&url).await?;
        let mut redirects = 0u8;

        loop {
            let host = url
                .host_str()
                .ok_or_else(|| CoreError::SsrfBlocked(format!("url has no host: {url}")))?
                .to_string();
            let port = url.port_or_known_default().unwrap_or(443);
            let client = self.pinned_client(&host, SocketAddr::new(hop.pinned_addr, port))?;

            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| CoreError::AdapterTransport(e.to_string()))?;

            if response.status().is_redirection() {
                redirects += 1;
                if redirects > self.safe_fetch.max_redirects() {
                    return Err(CoreError::SsrfBlocked("too many redirects".to_string()));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| CoreError::AdapterTransport("redirect with no Location header".to_string()))?;
                let next_url = url
                    .join(location)
                    .map_err(|e| CoreError::AdapterTransport(format!("invalid redirect location: {e}")))?;
                if !matches!(next_url.scheme(), "http" | "https") {
                    return Err(CoreError::SsrfBlocked(format!("redirect to unsupported scheme: {}", next_url.scheme())));
                }
                hop = self.safe_fetch.validate_redirect(&hop, &next_url).await?;
                url = next_url;
                continue;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !Self::content_type_allowed(&content_type) {
                return Err(CoreError::ToolExecDenied(format!("disallowed content-type: {content_type}")));
            }

            let max_body = self.safe_fetch.max_body_bytes();
            if let Some(len) = response.content_length() {
                if len as usize > max_body {
                    return Err(CoreError::ToolExecDenied(format!("response body too large: {len} bytes")));
                }
            }

            let status = response.status().as_u16();
            let bytes = response.bytes().await.map_err(|e| CoreError::AdapterTransport(e.to_string()))?;
            if bytes.len() > max_body {
                return Err(CoreError::ToolExecDenied(format!("response body too large: {} bytes", bytes.len())));
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();

            return Ok(ToolOutcome {
                output: serde_json::json!({
                    "status": status,
                    "content_type": content_type,
                    "untrusted_content": true,
                    "body": format!("{UNTRUSTED_START}\n{text}\n{UNTRUSTED_END}"),
                }),
                truncated: false,
            });
        }
    }
}
