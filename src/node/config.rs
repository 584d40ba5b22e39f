//! Node configuration types and persistence
//!
//! Handles loading and saving the daemon connection configuration from disk,
//! and generating sable.conf for embedded daemons.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

/// Errors raised while loading or persisting configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine configuration directory")]
    NoConfigDir,
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the wallet connects to the Sable network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Wallet owns the daemon process (write conf, start, stop)
    #[default]
    Embedded,
    /// User runs their own external daemon; the wallet only attaches
    External,
}

/// Network type for Sable
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Main network
    #[default]
    Mainnet,
    /// Test network
    Testnet,
    /// Local regression test network
    Regtest,
}

impl Network {
    /// Get the network name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Get the default RPC port for this network
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8232,
            Network::Testnet => 18232,
            Network::Regtest => 18344,
        }
    }
}

impl FromStr for Network {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            _ => Ok(Network::Mainnet),
        }
    }
}

/// Authentication method for RPC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Cookie-based authentication (auto-detect from data directory)
    #[default]
    Cookie,
    /// Username/password authentication
    Userpass,
}

/// Node configuration stored in node_config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Connection mode (embedded or external)
    #[serde(default)]
    pub mode: NodeMode,

    /// Network (mainnet, testnet, regtest)
    #[serde(default)]
    pub network: Network,

    /// Rescan the wallet on next start (one-shot, cleared after a
    /// successful launch)
    #[serde(default)]
    pub rescan: bool,

    /// Rebuild the block index on next start (one-shot, cleared after a
    /// successful launch)
    #[serde(default)]
    pub reindex: bool,

    /// Enable automatic note consolidation (consolidation=1)
    #[serde(default)]
    pub consolidation: bool,

    /// Delete old wallet transactions (deletetx=1)
    #[serde(default)]
    pub delete_old_tx: bool,

    /// Maintain the shielded transaction index (zindex=1)
    #[serde(default)]
    pub shielded_index: bool,

    /// Allow transactions with a user-supplied fee
    #[serde(default)]
    pub allow_custom_fees: bool,

    /// Custom command-line arguments for the daemon
    #[serde(default)]
    pub custom_args: String,

    /// Data directory path (default location when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<String>,

    /// RPC host
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,

    /// RPC port (0 means use network default)
    #[serde(default)]
    pub rpc_port: u16,

    /// Reach the RPC endpoint over TLS (external daemons behind a proxy)
    #[serde(default)]
    pub rpc_tls: bool,

    /// Authentication method
    #[serde(default)]
    pub auth_method: AuthMethod,

    /// RPC username (if using userpass auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_user: Option<String>,

    /// RPC password (if using userpass auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_password: Option<String>,
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: NodeMode::default(),
            network: Network::default(),
            rescan: false,
            reindex: false,
            consolidation: false,
            delete_old_tx: false,
            shielded_index: false,
            allow_custom_fees: false,
            custom_args: String::new(),
            data_directory: None,
            rpc_host: default_rpc_host(),
            rpc_port: 0, // Use network default
            rpc_tls: false,
            auth_method: AuthMethod::default(),
            rpc_user: None,
            rpc_password: None,
        }
    }
}

impl NodeConfig {
    /// Get the path to the node config file
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("SableWallet");

        // Ensure directory exists
        let _ = fs::create_dir_all(&config_dir);

        config_dir.join("node_config.json")
    }

    /// Load config from disk, or return default if not found
    pub fn load() -> Self {
        let path = Self::config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })?;

        log::info!("Node config saved to {}", path.display());
        Ok(())
    }

    /// Get the effective RPC port (using network default if not specified)
    pub fn effective_rpc_port(&self) -> u16 {
        if self.rpc_port > 0 {
            self.rpc_port
        } else {
            self.network.default_rpc_port()
        }
    }

    /// Get the directory where the embedded daemon binary lives
    pub fn daemon_dir() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("SableWallet")
                .join("node")
        }

        #[cfg(target_os = "macos")]
        {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("SableWallet")
                .join("node")
        }

        #[cfg(target_os = "linux")]
        {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".sable-wallet")
                .join("node")
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            PathBuf::from(".").join("node")
        }
    }

    /// Get the path to the sabled binary
    pub fn daemon_path() -> PathBuf {
        let node_dir = Self::daemon_dir();

        #[cfg(target_os = "windows")]
        {
            node_dir.join("sabled.exe")
        }

        #[cfg(not(target_os = "windows"))]
        {
            node_dir.join("sabled")
        }
    }

    /// Get the default Sable data directory
    pub fn default_data_dir() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Sable")
        }

        #[cfg(target_os = "macos")]
        {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Sable")
        }

        #[cfg(target_os = "linux")]
        {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".sable")
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            PathBuf::from(".").join("sable")
        }
    }

    /// Get the data directory for this config (explicit or default)
    pub fn get_data_directory(&self) -> PathBuf {
        match &self.data_directory {
            Some(dir) if !dir.is_empty() => {
                let expanded = crate::expand_path(dir);
                PathBuf::from(expanded)
            }
            _ => Self::default_data_dir(),
        }
    }

    /// Generate sable.conf content for embedded mode
    ///
    /// Network selection happens on the command line (-testnet, -regtest),
    /// so the conf only carries server and wallet toggles.
    pub fn generate_daemon_conf(&self) -> String {
        let mut lines = vec![
            "# Generated by Sable Wallet".to_string(),
            "# Do not edit manually - changes may be overwritten".to_string(),
            "".to_string(),
            "server=1".to_string(),
        ];

        if self.consolidation {
            lines.push("consolidation=1".to_string());
        }

        if self.delete_old_tx {
            lines.push("deletetx=1".to_string());
        }

        if self.shielded_index {
            lines.push("zindex=1".to_string());
        }

        lines.push("".to_string());
        lines.push("# RPC settings (localhost only for security)".to_string());
        lines.push("rpcbind=127.0.0.1".to_string());
        lines.push("rpcallowip=127.0.0.1".to_string());

        if self.auth_method == AuthMethod::Userpass {
            if let Some(ref user) = self.rpc_user {
                lines.push(format!("rpcuser={}", user));
            }
            if let Some(ref password) = self.rpc_password {
                lines.push(format!("rpcpassword={}", password));
            }
        }

        lines.join("\n")
    }

    /// Get the path to sable.conf
    pub fn daemon_conf_path(&self) -> PathBuf {
        self.get_data_directory().join("sable.conf")
    }

    /// Write sable.conf to disk
    pub fn write_daemon_conf(&self) -> Result<(), ConfigError> {
        let conf_path = self.daemon_conf_path();

        if let Some(parent) = conf_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let content = self.generate_daemon_conf();
        fs::write(&conf_path, content).map_err(|e| ConfigError::Write {
            path: conf_path.display().to_string(),
            source: e,
        })?;

        log::info!("sable.conf written to {}", conf_path.display());
        Ok(())
    }
}
