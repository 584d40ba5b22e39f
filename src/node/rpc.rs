//! JSON-RPC client for the Sable daemon
//!
//! Stateless request/response transport. Every call carries a fixed timeout
//! and classifies failures; retry policy belongs to callers, since a one-shot
//! balance query and a polling loop want different semantics.

use super::config::{AuthMethod, Network, NodeConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Fixed per-call timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// RPC failure classification
///
/// `Application` preserves the daemon's own message verbatim; the other
/// variants describe transport-level outcomes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("daemon rejected RPC credentials")]
    AuthFailure,
    #[error("daemon unreachable: {0}")]
    ConnectionRefused(String),
    #[error("RPC call timed out")]
    Timeout,
    #[error("malformed RPC response: {0}")]
    Protocol(String),
    #[error("daemon error {code}: {message}")]
    Application { code: i64, message: String },
}

/// RPC request structure
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Vec<Value>,
}

/// RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

/// Daemon-reported error object
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Resolved RPC endpoint: host, port, credentials and transport security.
///
/// Immutable once a session starts; replacing it means tearing down the
/// client and poller built on top of it.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Pre-computed Authorization header value, if credentials are known
    pub auth: Option<String>,
}

impl NodeEndpoint {
    /// Resolve the endpoint from configuration, reading the cookie file
    /// when cookie auth is selected
    pub fn from_config(config: &NodeConfig) -> Self {
        let auth = match config.auth_method {
            AuthMethod::Userpass => match (&config.rpc_user, &config.rpc_password) {
                (Some(user), Some(password)) => {
                    Some(format!("Basic {}", base64_encode(&format!("{}:{}", user, password))))
                }
                _ => None,
            },
            AuthMethod::Cookie => read_cookie_auth(config),
        };

        Self {
            host: config.rpc_host.clone(),
            port: config.effective_rpc_port(),
            tls: config.rpc_tls,
            auth,
        }
    }

    /// Endpoint URL for HTTP POST
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Read cookie authentication from the data directory
///
/// The daemon writes `__cookie__:randomhex` into `.cookie` under the
/// network-specific subdirectory.
fn read_cookie_auth(config: &NodeConfig) -> Option<String> {
    let data_dir = config.get_data_directory();

    let cookie_path = match config.network {
        Network::Mainnet => data_dir.join(".cookie"),
        Network::Testnet => data_dir.join("testnet").join(".cookie"),
        Network::Regtest => data_dir.join("regtest").join(".cookie"),
    };

    match std::fs::read_to_string(&cookie_path) {
        Ok(content) => {
            let encoded = base64_encode(content.trim());
            Some(format!("Basic {}", encoded))
        }
        Err(_) => None,
    }
}

/// RPC client bound to one endpoint
pub struct RpcClient {
    client: reqwest::Client,
    endpoint: NodeEndpoint,
    timeout: Duration,
}

impl RpcClient {
    /// Create a client for an endpoint with the default per-call timeout
    pub fn new(endpoint: NodeEndpoint) -> Self {
        Self::with_timeout(endpoint, REQUEST_TIMEOUT)
    }

    /// Create a client with an explicit per-call timeout
    pub fn with_timeout(endpoint: NodeEndpoint, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }

    /// Create a client from node config (re-reads the cookie file)
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(NodeEndpoint::from_config(config))
    }

    /// The endpoint this client is bound to
    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    /// Make an RPC call
    ///
    /// No retries here; callers decide whether and how to retry.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method,
            params,
        };

        let mut req = self
            .client
            .post(self.endpoint.url())
            .timeout(self.timeout)
            .json(&request);

        if let Some(ref auth) = self.endpoint.auth {
            req = req.header("Authorization", auth);
        }

        let response = req.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::AuthFailure);
        }

        let body = response.text().await.map_err(classify_transport_error)?;
        let rpc_response: RpcResponse = serde_json::from_str(&body)
            .map_err(|e| RpcError::Protocol(format!("invalid JSON: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(RpcError::Application {
                code: error.code,
                message: error.message,
            });
        }

        rpc_response
            .result
            .ok_or_else(|| RpcError::Protocol("response missing result".to_string()))
    }

    /// Check if the daemon is ready by calling getinfo
    pub async fn is_ready(&self) -> bool {
        self.call("getinfo", vec![]).await.is_ok()
    }

    /// Chain summary from getinfo
    pub async fn get_info(&self) -> Result<NodeInfo, RpcError> {
        let value = self.call("getinfo", vec![]).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Protocol(format!("getinfo: {}", e)))
    }

    /// Wallet balance summary (transparent/shielded/total, decimal strings)
    pub async fn z_get_total_balance(&self) -> Result<Balances, RpcError> {
        let value = self.call("z_gettotalbalance", vec![]).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("z_gettotalbalance: {}", e)))
    }

    /// Submit an asynchronous send operation; returns the operation id
    pub async fn z_send_many(&self, params: Vec<Value>) -> Result<String, RpcError> {
        let value = self.call("z_sendmany", params).await?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RpcError::Protocol("z_sendmany returned no operation id".to_string()))
    }

    /// Poll the status of one asynchronous operation
    pub async fn z_get_operation_status(&self, opid: &str) -> Result<OperationStatus, RpcError> {
        let params = vec![Value::Array(vec![Value::String(opid.to_string())])];
        let value = self.call("z_getoperationstatus", params).await?;

        let statuses: Vec<OperationStatus> = serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("z_getoperationstatus: {}", e)))?;

        statuses
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Protocol(format!("no status for operation {}", opid)))
    }

    /// Ask the daemon whether it considers an address valid
    pub async fn validate_address(&self, address: &str, shielded: bool) -> Result<bool, RpcError> {
        let method = if shielded {
            "z_validateaddress"
        } else {
            "validateaddress"
        };
        let value = self
            .call(method, vec![Value::String(address.to_string())])
            .await?;
        Ok(value
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Send stop command for graceful shutdown
    pub async fn stop(&self) -> Result<String, RpcError> {
        let value = self.call("stop", vec![]).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

/// Classify a reqwest transport failure into the RPC taxonomy
fn classify_transport_error(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout
    } else if e.is_decode() {
        RpcError::Protocol(e.to_string())
    } else {
        RpcError::ConnectionRefused(e.to_string())
    }
}

/// Chain summary returned by getinfo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub protocolversion: i64,
    #[serde(default)]
    pub blocks: u64,
    #[serde(default)]
    pub longestchain: u64,
    #[serde(default)]
    pub connections: u32,
    #[serde(default)]
    pub notarized: u64,
}

/// Wallet balances as reported by z_gettotalbalance (decimal strings)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    #[serde(default)]
    pub transparent: String,
    #[serde(default, rename = "private")]
    pub shielded: String,
    #[serde(default)]
    pub total: String,
}

/// Status of one asynchronous daemon operation
#[derive(Debug, Clone, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    /// One of: queued, executing, success, failed
    pub status: String,
    /// Build progress fraction in [0, 1], when the daemon reports one
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// Result payload of a successful operation
#[derive(Debug, Clone, Deserialize)]
pub struct OperationResult {
    pub txid: String,
}

/// Wait for the daemon to answer RPC, with bounded backoff
///
/// A new client is created on each attempt so the cookie file is re-read;
/// it may not exist while the daemon is still starting.
pub async fn wait_for_node_ready(config: &NodeConfig, timeout_secs: u64) -> Result<(), RpcError> {
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let mut delay = Duration::from_millis(500);

    log::info!(
        "Waiting for node to be ready (timeout: {}s)...",
        timeout_secs
    );

    loop {
        if start.elapsed() > timeout {
            return Err(RpcError::Timeout);
        }

        let client = RpcClient::from_config(config);
        if client.is_ready().await {
            log::info!("Node is ready (took {:?})", start.elapsed());
            return Ok(());
        }

        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, Duration::from_secs(3));
    }
}

/// Gracefully stop the daemon via RPC
///
/// An unreachable endpoint means the daemon is already down, which is the
/// outcome the caller wanted.
pub async fn stop_node_gracefully(config: &NodeConfig) -> Result<(), RpcError> {
    let client = RpcClient::from_config(config);

    log::info!("Sending RPC stop command...");
    match client.stop().await {
        Ok(msg) => {
            log::info!("Node stop response: {}", msg);
            Ok(())
        }
        Err(RpcError::ConnectionRefused(_)) | Err(RpcError::Timeout) => {
            log::info!("Node appears to already be stopped");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Plain base64 encoding for the Basic auth header (no external dependency)
fn base64_encode(input: &str) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }

    out
}
