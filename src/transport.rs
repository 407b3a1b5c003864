use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use rand::RngCore;
use reqwest::Method;
use serde_json::Value;

/// Payload code the platform uses to say "back off".
pub const RATE_LIMIT_CODE: i64 = 300013;

/// Transport-level retry for transient network faults. This is intentionally
/// tiny; everything else (rotation, wait rounds) belongs to the retry
/// strategy, not the transport.
const TRANSPORT_ATTEMPTS: u32 = 2;

/// Classified result of one platform call.
///
/// `AuthExpired` is never produced by the transport itself: an expired
/// per-URL signed token surfaces as `EmptyData`, and the walker upgrades it
/// when it knows the note has comments.
#[derive(Debug, Clone)]
pub enum ApiOutcome<T> {
    Success(T),
    RateLimited,
    AuthExpired,
    /// HTTP 200, application success flag true, but `data` was null/empty.
    EmptyData,
    /// Application success flag false with a code other than the sentinel.
    Unknown { code: i64, msg: String },
    /// HTTP 5xx after the transport-level retries.
    Server { status: u16 },
    /// Connection failure, timeout, or malformed JSON after retries.
    Transport { reason: String },
    /// Parseable response with an unexpected shape.
    Protocol { reason: String },
}

/// Outcome classification without the payload, for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    RateLimited,
    AuthExpired,
    EmptyData,
    Unknown,
    Server,
    Transport,
    Protocol,
}

impl<T> ApiOutcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ApiOutcome::Success(_) => OutcomeKind::Success,
            ApiOutcome::RateLimited => OutcomeKind::RateLimited,
            ApiOutcome::AuthExpired => OutcomeKind::AuthExpired,
            ApiOutcome::EmptyData => OutcomeKind::EmptyData,
            ApiOutcome::Unknown { .. } => OutcomeKind::Unknown,
            ApiOutcome::Server { .. } => OutcomeKind::Server,
            ApiOutcome::Transport { .. } => OutcomeKind::Transport,
            ApiOutcome::Protocol { .. } => OutcomeKind::Protocol,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ApiOutcome::Success(_) => "ok".to_string(),
            ApiOutcome::RateLimited => format!("rate limited (code {})", RATE_LIMIT_CODE),
            ApiOutcome::AuthExpired => "signed token expired or invalid".to_string(),
            ApiOutcome::EmptyData => "empty data in response".to_string(),
            ApiOutcome::Unknown { code, msg } => format!("api error code {code}: {msg}"),
            ApiOutcome::Server { status } => format!("server error HTTP {status}"),
            ApiOutcome::Transport { reason } => format!("transport error: {reason}"),
            ApiOutcome::Protocol { reason } => format!("unexpected response shape: {reason}"),
        }
    }

    /// Upgrade `EmptyData` to `AuthExpired` when the caller knows the note
    /// has comments (first top-level page with a non-zero expected count).
    pub fn empty_as_auth_expired(self, apply: bool) -> Self {
        match self {
            ApiOutcome::EmptyData if apply => ApiOutcome::AuthExpired,
            other => other,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiOutcome<U> {
        match self {
            ApiOutcome::Success(v) => ApiOutcome::Success(f(v)),
            ApiOutcome::RateLimited => ApiOutcome::RateLimited,
            ApiOutcome::AuthExpired => ApiOutcome::AuthExpired,
            ApiOutcome::EmptyData => ApiOutcome::EmptyData,
            ApiOutcome::Unknown { code, msg } => ApiOutcome::Unknown { code, msg },
            ApiOutcome::Server { status } => ApiOutcome::Server { status },
            ApiOutcome::Transport { reason } => ApiOutcome::Transport { reason },
            ApiOutcome::Protocol { reason } => ApiOutcome::Protocol { reason },
        }
    }
}

/// Everything the signer attaches to one outgoing request.
pub struct SignedParts {
    pub headers: Vec<(String, String)>,
    pub cookie: String,
    pub body: Option<Value>,
}

/// Seam for the platform's request-signature scheme.
///
/// The production encoder (x-s / x-t style header signatures) is an external
/// collaborator; the default implementation forwards the credential cookie
/// plus stable browser headers, which is enough against a test double or a
/// signing proxy.
pub trait SignRequest: Send + Sync {
    fn sign(&self, path: &str, body: Option<&Value>, cookie: &str) -> SignedParts;
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default)]
pub struct PlainSigner;

impl SignRequest for PlainSigner {
    fn sign(&self, _path: &str, body: Option<&Value>, cookie: &str) -> SignedParts {
        let mut trace = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut trace);
        SignedParts {
            headers: vec![
                ("accept".to_string(), "application/json, text/plain, */*".to_string()),
                ("origin".to_string(), "https://www.xiaohongshu.com".to_string()),
                ("referer".to_string(), "https://www.xiaohongshu.com/".to_string()),
                ("user-agent".to_string(), USER_AGENT.to_string()),
                ("x-b3-traceid".to_string(), hex::encode(trace)),
            ],
            cookie: cookie.to_string(),
            body: body.cloned(),
        }
    }
}

/// One HTTP call against the platform API, classified.
///
/// Owns no credential state and no retry beyond the tiny transient-fault
/// retry above.
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<dyn SignRequest>,
}

impl Transport {
    pub fn new(
        base_url: &str,
        proxy: Option<&str>,
        timeout: Duration,
        signer: Arc<dyn SignRequest>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| eyre!("invalid proxy url '{proxy_url}': {e}"))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| eyre!("failed to build http client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
        })
    }

    pub async fn get(&self, path_and_query: &str, cookie: &str) -> ApiOutcome<Value> {
        self.execute(Method::GET, path_and_query, None, cookie).await
    }

    pub async fn post(&self, path: &str, body: Value, cookie: &str) -> ApiOutcome<Value> {
        self.execute(Method::POST, path, Some(body), cookie).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        cookie: &str,
    ) -> ApiOutcome<Value> {
        let signed = self.signer.sign(path, body.as_ref(), cookie);
        let url = format!("{}{}", self.base_url, path);

        let mut delay = Duration::from_millis(300);
        let mut last_reason = String::new();

        for attempt in 1..=TRANSPORT_ATTEMPTS {
            let mut req = self.http.request(method.clone(), &url);
            for (name, value) in &signed.headers {
                req = req.header(name.as_str(), value.as_str());
            }
            req = req.header(reqwest::header::COOKIE, signed.cookie.as_str());
            if let Some(b) = &signed.body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        last_reason = format!("HTTP {status}");
                        if attempt < TRANSPORT_ATTEMPTS {
                            tracing::warn!(attempt, %status, url = %url, "server error; retrying");
                            tokio::time::sleep(delay).await;
                            delay = delay.saturating_mul(2);
                            continue;
                        }
                        return ApiOutcome::Server {
                            status: status.as_u16(),
                        };
                    }
                    match resp.json::<Value>().await {
                        Ok(payload) => return classify(payload),
                        Err(err) => {
                            last_reason = format!("malformed JSON: {err}");
                            if attempt < TRANSPORT_ATTEMPTS {
                                tracing::warn!(attempt, error = %err, url = %url, "bad response body; retrying");
                                tokio::time::sleep(delay).await;
                                delay = delay.saturating_mul(2);
                                continue;
                            }
                        }
                    }
                }
                Err(err) => {
                    last_reason = err.to_string();
                    if attempt < TRANSPORT_ATTEMPTS {
                        tracing::warn!(attempt, error = %err, url = %url, "request failed; retrying");
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                        continue;
                    }
                }
            }
        }

        ApiOutcome::Transport {
            reason: last_reason,
        }
    }
}

/// Classify an application payload into an outcome.
///
/// The rate-limit sentinel wins regardless of the success flag or HTTP
/// status; the platform has been observed sending it both ways.
fn classify(payload: Value) -> ApiOutcome<Value> {
    let code = payload.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == RATE_LIMIT_CODE {
        return ApiOutcome::RateLimited;
    }

    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !success {
        let msg = payload
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return ApiOutcome::Unknown { code, msg };
    }

    match payload.get("data") {
        None | Some(Value::Null) => ApiOutcome::EmptyData,
        Some(Value::Object(map)) if map.is_empty() => ApiOutcome::EmptyData,
        Some(data) => ApiOutcome::Success(data.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_success_with_data() {
        let out = classify(json!({"success": true, "code": 0, "data": {"comments": []}}));
        assert!(matches!(out, ApiOutcome::Success(_)));
    }

    #[test]
    fn classify_rate_limit_sentinel_wins_over_success_flag() {
        let out = classify(json!({"success": true, "code": 300013, "data": {"x": 1}}));
        assert_eq!(out.kind(), OutcomeKind::RateLimited);
    }

    #[test]
    fn classify_empty_data_object() {
        let out = classify(json!({"success": true, "code": 0, "data": {}}));
        assert_eq!(out.kind(), OutcomeKind::EmptyData);

        let out = classify(json!({"success": true, "code": 0}));
        assert_eq!(out.kind(), OutcomeKind::EmptyData);
    }

    #[test]
    fn classify_application_failure() {
        let out = classify(json!({"success": false, "code": -101, "msg": "note not found"}));
        match out {
            ApiOutcome::Unknown { code, msg } => {
                assert_eq!(code, -101);
                assert_eq!(msg, "note not found");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn empty_upgrades_to_auth_expired_only_when_asked() {
        let out: ApiOutcome<Value> = ApiOutcome::EmptyData;
        assert_eq!(
            out.clone().empty_as_auth_expired(true).kind(),
            OutcomeKind::AuthExpired
        );
        assert_eq!(
            out.empty_as_auth_expired(false).kind(),
            OutcomeKind::EmptyData
        );
    }
}
