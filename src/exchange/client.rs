use std::time::Duration;

use metrics::counter;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;

use super::auth::ExchangeAuth;
use crate::errors::BotError;

/// Business code of a successful response.
pub const SUCCESS_CODE: &str = "00000";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1_000),
        }
    }
}

/// Outcome of a single attempt that did not produce a usable body.
#[derive(Debug)]
enum AttemptError {
    /// Timeout, refused connection or 5xx: worth another signed attempt.
    Retryable(String),
    Fatal(BotError),
}

/// Authenticated REST client. Every call goes through [`SignedClient::execute`].
#[derive(Debug, Clone)]
pub struct SignedClient {
    http: Client,
    auth: ExchangeAuth,
    base_url: String,
    demo: bool,
    retry: RetryPolicy,
}

impl SignedClient {
    pub fn new(auth: ExchangeAuth, base_url: &str, timeout: Duration) -> Result<Self, BotError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BotError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
            demo: false,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route orders to the exchange's simulated-trading environment.
    pub fn with_demo(mut self, demo: bool) -> Self {
        self.demo = demo;
        self
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, BotError> {
        self.execute(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, BotError> {
        self.execute(Method::POST, path, &[], Some(body)).await
    }

    /// Send a signed request and return the decoded JSON body.
    ///
    /// Timeouts, connection failures and 5xx responses are retried with a
    /// fixed delay; timestamp and signature are recomputed for every attempt.
    /// Everything else fails immediately.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, BotError> {
        let url = self.build_url(path, query)?;
        let request_path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let body = body.map(Value::to_string).unwrap_or_default();

        let mut attempt: u32 = 0;
        loop {
            counter!("api_requests_total").increment(1);

            match self.send_once(&method, &url, &request_path, &body).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Retryable(reason)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    counter!("api_retries_total").increment(1);
                    tracing::warn!(
                        method = %method,
                        path = %path,
                        attempt,
                        max_retries = self.retry.max_retries,
                        reason = %reason,
                        "Retrying exchange request"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(AttemptError::Retryable(reason)) => {
                    return Err(BotError::Network(format!(
                        "{method} {path} failed after {} attempts: {reason}",
                        attempt + 1
                    )));
                }
                Err(AttemptError::Fatal(e)) => {
                    tracing::debug!(method = %method, path = %path, error = %e, "Exchange request failed");
                    return Err(e);
                }
            }
        }
    }

    fn build_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, BotError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| BotError::InvalidRequest(format!("bad url for {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        request_path: &str,
        body: &str,
    ) -> Result<Value, AttemptError> {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = self
            .auth
            .sign(&timestamp, method.as_str(), request_path, body)
            .map_err(AttemptError::Fatal)?;

        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header("ACCESS-KEY", &self.auth.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-PASSPHRASE", &self.auth.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if self.demo {
            req = req.header("X-SIMULATED-TRADING", "1");
        }
        if !body.is_empty() {
            req = req.body(body.to_string());
        }

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(classify_transport)?;

        classify_response(status, &text)
    }
}

fn classify_transport(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() || e.is_connect() {
        AttemptError::Retryable(e.to_string())
    } else {
        AttemptError::Fatal(BotError::Network(e.to_string()))
    }
}

/// Business code as a string; the exchange sends it either quoted or bare.
pub(crate) fn response_code(body: &Value) -> Option<String> {
    match body.get("code")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify_response(status: StatusCode, text: &str) -> Result<Value, AttemptError> {
    if status.is_server_error() {
        return Err(AttemptError::Retryable(format!("HTTP {status}")));
    }

    let parsed: Option<Value> = serde_json::from_str(text).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or(text)
        .to_string();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AttemptError::Fatal(BotError::Auth(format!("HTTP {status}: {message}"))));
    }

    if let Some(code) = parsed.as_ref().and_then(response_code) {
        if code != SUCCESS_CODE {
            return Err(AttemptError::Fatal(BotError::from_exchange_code(&code, &message)));
        }
    }

    if !status.is_success() {
        return Err(AttemptError::Fatal(BotError::Exchange {
            code: status.as_u16().to_string(),
            message,
        }));
    }

    parsed.ok_or_else(|| AttemptError::Fatal(BotError::Data("response body is not JSON".into())))
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_errors_are_retryable() {
        let result = classify_response(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(result, Err(AttemptError::Retryable(_))));
    }

    #[test]
    fn test_success_body_is_returned() {
        let body = json!({ "code": "00000", "data": { "serverTime": "1700000000000" } });
        let value = classify_response(StatusCode::OK, &body.to_string()).unwrap();
        assert_eq!(value["data"]["serverTime"], "1700000000000");
    }

    #[test]
    fn test_business_error_in_ok_response() {
        let body = json!({ "code": "40762", "msg": "The order amount exceeds the balance" });
        let result = classify_response(StatusCode::OK, &body.to_string());
        assert!(matches!(
            result,
            Err(AttemptError::Fatal(BotError::Exchange { ref code, .. })) if code == "40762"
        ));
    }

    #[test]
    fn test_bad_signature_is_auth() {
        let body = json!({ "code": "40009", "msg": "sign signature error" });
        let result = classify_response(StatusCode::BAD_REQUEST, &body.to_string());
        assert!(matches!(result, Err(AttemptError::Fatal(BotError::Auth(_)))));
    }

    #[test]
    fn test_unauthorized_status_is_auth() {
        let result = classify_response(StatusCode::UNAUTHORIZED, "nope");
        assert!(matches!(result, Err(AttemptError::Fatal(BotError::Auth(_)))));
    }

    #[test]
    fn test_numeric_code_is_accepted() {
        assert_eq!(response_code(&json!({ "code": 0 })), Some("0".into()));
        assert_eq!(response_code(&json!({ "code": "00000" })), Some("00000".into()));
        assert_eq!(response_code(&json!({ "data": 1 })), None);
    }

    #[test]
    fn test_non_json_success_is_data_error() {
        let result = classify_response(StatusCode::OK, "pong");
        assert!(matches!(result, Err(AttemptError::Fatal(BotError::Data(_)))));
    }
}
