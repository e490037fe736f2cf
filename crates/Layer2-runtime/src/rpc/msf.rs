//! Metasploit console RPC client (JSON-RPC 2.0 over HTTP)

use super::{ConsoleRead, RemoteConsole, RpcClient, RpcEndpoint, RpcError, RpcSession};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// JSON-RPC endpoint path on the console service
const RPC_PATH: &str = "/api/v1/json-rpc";

/// User the console service is started with
const DEFAULT_USER: &str = "msf";

/// Per-request HTTP timeout
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct LoginResult {
    token: String,
}

#[derive(Deserialize)]
struct CreateResult {
    id: Value,
    #[serde(default)]
    prompt: String,
}

#[derive(Deserialize)]
struct ReadResult {
    #[serde(default)]
    data: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    busy: bool,
}

/// JSON-RPC console client
pub struct MsfRpcClient {
    client: Client,
    user: String,
    request_id: AtomicU64,
}

impl MsfRpcClient {
    pub fn new() -> Result<Self, RpcError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Set custom HTTP timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user: DEFAULT_USER.to_string(),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    fn url(endpoint: &RpcEndpoint) -> String {
        format!("http://{}:{}{}", endpoint.host, endpoint.port, RPC_PATH)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &RpcEndpoint,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        trace!(method, host = %endpoint.host, "JSON-RPC call");

        let response = self
            .client
            .post(Self::url(endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcError::Auth(format!("{} returned {}", method, status)));
        }

        let body: RpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Protocol(format!("{} returned invalid JSON ({}): {}", method, status, e))
            }
        })?;

        if let Some(fault) = body.error {
            return Err(classify_fault(method, fault));
        }

        let result = body
            .result
            .ok_or_else(|| RpcError::Protocol(format!("{} returned no result", method)))?;

        serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("{} returned unexpected result: {}", method, e)))
    }
}

#[async_trait]
impl RpcClient for MsfRpcClient {
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<RpcSession, RpcError> {
        let login: LoginResult = self
            .call(
                endpoint,
                "auth.login",
                json!([self.user, endpoint.password]),
            )
            .await
            .map_err(|e| match e {
                RpcError::Protocol(msg) => RpcError::Auth(msg),
                other => other,
            })?;

        debug!(host = %endpoint.host, port = endpoint.port, "Authenticated with console service");
        Ok(RpcSession {
            endpoint: endpoint.clone(),
            token: login.token,
        })
    }

    async fn create_console(&self, session: &RpcSession) -> Result<RemoteConsole, RpcError> {
        let created: CreateResult = self
            .call(&session.endpoint, "console.create", json!([session.token]))
            .await?;

        // ids come back as numbers or strings depending on the service version
        let id = match created.id {
            Value::String(s) => s,
            other => other.to_string(),
        };

        Ok(RemoteConsole {
            id,
            prompt: normalize_prompt(&created.prompt),
        })
    }

    async fn write(
        &self,
        session: &RpcSession,
        console_id: &str,
        data: &str,
    ) -> Result<(), RpcError> {
        self.call::<Value>(
            &session.endpoint,
            "console.write",
            json!([session.token, console_id, data]),
        )
        .await
        .map(|_| ())
        .map_err(|e| match e {
            RpcError::Protocol(msg) => RpcError::Write(msg),
            other => other,
        })
    }

    async fn read(
        &self,
        session: &RpcSession,
        console_id: &str,
    ) -> Result<ConsoleRead, RpcError> {
        let read: ReadResult = self
            .call(
                &session.endpoint,
                "console.read",
                json!([session.token, console_id]),
            )
            .await
            .map_err(|e| match e {
                RpcError::Protocol(msg) => RpcError::Read(msg),
                other => other,
            })?;

        Ok(ConsoleRead {
            output: read.data,
            prompt: normalize_prompt(&read.prompt),
            busy: read.busy,
        })
    }

    async fn destroy_console(
        &self,
        session: &RpcSession,
        console_id: &str,
    ) -> Result<(), RpcError> {
        self.call::<Value>(
            &session.endpoint,
            "console.destroy",
            json!([session.token, console_id]),
        )
        .await
        .map(|_| ())
    }
}

fn classify_fault(method: &str, fault: RpcFault) -> RpcError {
    let detail = match &fault.data {
        Some(data) => format!("{} ({}): {} {}", method, fault.code, fault.message, data),
        None => format!("{} ({}): {}", method, fault.code, fault.message),
    };
    let lower = fault.message.to_lowercase();

    if lower.contains("console") && (lower.contains("invalid") || lower.contains("unknown")) {
        RpcError::UnknownConsole(detail)
    } else if fault.code == 401
        || lower.contains("login failed")
        || lower.contains("authentication")
        || lower.contains("invalid token")
    {
        RpcError::Auth(detail)
    } else {
        RpcError::Protocol(detail)
    }
}

/// Strip ANSI escapes and readline markers from a prompt
pub fn normalize_prompt(raw: &str) -> String {
    let stripped = strip_ansi_escapes::strip(raw.as_bytes());
    String::from_utf8_lossy(&stripped)
        .chars()
        .filter(|c| *c != '\u{1}' && *c != '\u{2}')
        .collect::<String>()
        .trim_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(
            normalize_prompt("\u{1}\u{1b}[4m\u{2}msf6\u{1}\u{1b}[0m\u{2} > "),
            "msf6 > "
        );
        assert_eq!(normalize_prompt("msf6 exploit(handler) > \n"), "msf6 exploit(handler) > ");
        assert_eq!(normalize_prompt(""), "");
    }

    #[test]
    fn test_fault_classification() {
        let fault = RpcFault {
            code: 500,
            message: "Invalid Console ID".into(),
            data: None,
        };
        assert!(matches!(
            classify_fault("console.read", fault),
            RpcError::UnknownConsole(_)
        ));

        let fault = RpcFault {
            code: 401,
            message: "Login Failed".into(),
            data: None,
        };
        assert!(matches!(
            classify_fault("auth.login", fault),
            RpcError::Auth(_)
        ));

        let fault = RpcFault {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert!(matches!(
            classify_fault("console.tabs", fault),
            RpcError::Protocol(_)
        ));
    }

    #[test]
    fn test_url() {
        let endpoint = RpcEndpoint::new("10.0.0.2", 55553, "pw");
        assert_eq!(
            MsfRpcClient::url(&endpoint),
            "http://10.0.0.2:55553/api/v1/json-rpc"
        );
    }
}
