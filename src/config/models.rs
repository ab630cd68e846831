//! Configuration data structures for the hub.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde-friendly and carry defaults so that a minimal config only has to name its
//! modules. Module entries are the static half of a module record: the hub seeds its
//! registry from them at startup.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_secret_path() -> String {
    ".secret".to_string()
}

fn default_mods_dir() -> String {
    "./mods".to_string()
}

fn default_registration_path() -> String {
    "/register".to_string()
}

fn default_true() -> bool {
    true
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_auth_type() -> String {
    "basic".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default = "default_hub_name")]
    pub name: String,
    pub listen_addr: String,
    #[serde(default = "default_secret_path")]
    pub secret_path: String,
    /// Create the secret file at startup when it does not exist yet
    #[serde(default = "default_true")]
    pub generate_secret: bool,
    #[serde(default = "default_mods_dir")]
    pub mods_dir: String,
    #[serde(default = "default_registration_path")]
    pub registration_path: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub auth: HubAuthConfig,
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
}

fn default_hub_name() -> String {
    "modhub".to_string()
}

impl HubConfig {
    /// Create a new hub configuration builder
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: default_hub_name(),
            listen_addr: "127.0.0.1:2000".to_string(),
            secret_path: default_secret_path(),
            generate_secret: true,
            mods_dir: default_mods_dir(),
            registration_path: default_registration_path(),
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
            protocol: ProtocolConfig::default(),
            persistence: PersistenceConfig::default(),
            auth: HubAuthConfig::default(),
            modules: HashMap::new(),
        }
    }
}

/// Builder for HubConfig, mostly used by tests and embedders
#[derive(Default)]
pub struct HubConfigBuilder {
    listen_addr: Option<String>,
    secret_path: Option<String>,
    supervisor: Option<SupervisorConfig>,
    protocol: Option<ProtocolConfig>,
    auth: Option<HubAuthConfig>,
    modules: HashMap<String, ModuleConfig>,
}

impl HubConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set the shared secret file path
    pub fn secret_path(mut self, path: impl Into<String>) -> Self {
        self.secret_path = Some(path.into());
        self
    }

    pub fn supervisor(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = Some(config);
        self
    }

    pub fn protocol(mut self, config: ProtocolConfig) -> Self {
        self.protocol = Some(config);
        self
    }

    pub fn auth(mut self, config: HubAuthConfig) -> Self {
        self.auth = Some(config);
        self
    }

    /// Add a statically configured module
    pub fn module(mut self, name: impl Into<String>, config: ModuleConfig) -> Self {
        self.modules.insert(name.into(), config);
        self
    }

    /// Build the final HubConfig
    pub fn build(self) -> Result<HubConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        Ok(HubConfig {
            listen_addr,
            secret_path: self.secret_path.unwrap_or_else(default_secret_path),
            supervisor: self.supervisor.unwrap_or_default(),
            protocol: self.protocol.unwrap_or_default(),
            auth: self.auth.unwrap_or_default(),
            modules: self.modules,
            ..HubConfig::default()
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// Delay between two supervision ticks
    pub interval_ms: u64,
    /// How long a record may stay Loading before it is declared in Error (0 disables)
    pub loading_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 50,
            loading_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Path of the module control endpoint
    pub command_path: String,
    /// Upper bound for handshake, ping, shutdown and custom command calls
    pub request_timeout_ms: u64,
    /// Upper bound for a proxied request
    pub proxy_timeout_ms: u64,
    /// Delay between a Shutdown reply and the module listener closing
    pub shutdown_grace_ms: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Address used for modules that register without static configuration
    pub default_address: String,
    pub default_protocol: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_path: "/cmd".to_string(),
            request_timeout_ms: 2_000,
            proxy_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            port_range_start: 4000,
            port_range_end: 4999,
            default_address: default_address(),
            default_protocol: default_protocol(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON snapshot file; records are only logged when unset
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubAuthConfig {
    /// htpasswd-style credentials file used by the basic auth gate
    pub credentials_path: Option<String>,
    pub realm: String,
    /// Put the `/hub` admin API behind the same gate
    pub protect_admin: bool,
}

impl Default for HubAuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            realm: "modhub".to_string(),
            protect_admin: false,
        }
    }
}

/// Static description of one module.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModuleConfig {
    #[serde(default)]
    pub version: u32,
    /// Type tag, e.g. "web" or "web bind"
    #[serde(default)]
    pub types: String,
    /// How to obtain and run the module; absent means the hub manages no process
    #[serde(default)]
    pub exe: Option<ExecSpec>,
    #[serde(default)]
    pub binding: BindingConfig,
    #[serde(default)]
    pub auth: ModuleAuthConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Source reference; remote when it looks like a git/http URL
    #[serde(default)]
    pub src: String,
    /// Command line run to start the module
    #[serde(default)]
    pub main: String,
    /// Working directory of the module binary
    #[serde(default)]
    pub bin: String,
}

impl ExecSpec {
    /// Whether `src` names something that has to be fetched first
    pub fn is_remote(&self) -> bool {
        if self.src.starts_with("git@") {
            return true;
        }
        matches!(
            url::Url::parse(&self.src).map(|u| u.scheme().to_string()).as_deref(),
            Ok("http") | Ok("https") | Ok("ssh") | Ok("git")
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BindingConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// 0 lets the hub pick a port at handshake time
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// File served directly for "bind" modules
    #[serde(default)]
    pub root: Option<String>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
            protocol: default_protocol(),
            routes: Vec::new(),
            root: None,
        }
    }
}

/// Public pattern → backend path mapping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Route {
    pub from: String,
    pub to: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
}

impl Route {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            methods: default_methods(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModuleAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_auth_type")]
    pub kind: String,
}

impl Default for ModuleAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_auth_type(),
        }
    }
}
