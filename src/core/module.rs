//! Module records: the unit the registry stores and the supervisor drives.
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use crate::config::models::BindingConfig as Binding;
use crate::{
    config::models::{ExecSpec, ModuleAuthConfig, ModuleConfig, ProtocolConfig},
    core::state::{self, LivenessContext, LivenessTransition, ModuleState},
};

/// Capabilities parsed from a module's type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleTypes {
    /// Proxied over HTTP, gets a resource passthrough route
    pub web: bool,
    /// Serves a root file directly when one is configured
    pub bind: bool,
}

impl ModuleTypes {
    pub fn parse(tag: &str) -> Self {
        let tag = tag.to_ascii_lowercase();
        Self {
            web: tag.contains("web"),
            bind: tag.contains("bind"),
        }
    }
}

/// Everything the hub knows about one module.
///
/// The lifecycle state is private: it only changes through the transition methods
/// below, each of which delegates the decision to [`crate::core::state`].
#[derive(Debug, Clone, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub version: u32,
    pub types: ModuleTypes,
    pub exec: Option<ExecSpec>,
    pub binding: Binding,
    pub auth: ModuleAuthConfig,
    state: ModuleState,
    state_since: DateTime<Utc>,
    #[serde(skip)]
    secret_hash: Option<String>,
    pid: Option<u32>,
    #[serde(skip)]
    awaiting_handshake: bool,
    custom_commands: Vec<String>,
}

impl ModuleRecord {
    /// Seed a record from static configuration.
    pub fn from_config(name: impl Into<String>, config: &ModuleConfig) -> Self {
        Self {
            name: name.into(),
            version: config.version,
            types: ModuleTypes::parse(&config.types),
            exec: config.exe.clone(),
            binding: config.binding.clone(),
            auth: config.auth.clone(),
            state: ModuleState::Unknown,
            state_since: Utc::now(),
            secret_hash: None,
            pid: None,
            awaiting_handshake: false,
            custom_commands: Vec::new(),
        }
    }

    /// Record for a module that announced itself without static configuration.
    pub fn dynamic(name: impl Into<String>, protocol: &ProtocolConfig) -> Self {
        let config = ModuleConfig {
            types: "web".to_string(),
            binding: Binding {
                address: protocol.default_address.clone(),
                protocol: protocol.default_protocol.clone(),
                ..Binding::default()
            },
            ..ModuleConfig::default()
        };
        Self::from_config(name, &config)
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn state_since(&self) -> DateTime<Utc> {
        self.state_since
    }

    pub fn secret_hash(&self) -> Option<&str> {
        self.secret_hash.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn awaiting_handshake(&self) -> bool {
        self.awaiting_handshake
    }

    pub fn custom_commands(&self) -> &[String] {
        &self.custom_commands
    }

    /// Whether the hub manages a process for this module
    pub fn is_managed(&self) -> bool {
        self.exec.is_some()
    }

    /// Base URL of the module's registered endpoint joined with `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.binding.protocol, self.binding.address, self.binding.port, path
        )
    }

    fn set_state(&mut self, next: ModuleState, now: DateTime<Utc>) {
        if self.state != next {
            self.state = next;
            self.state_since = now;
        }
    }

    /// Source fetched into `bin_dir`.
    pub fn mark_downloaded(&mut self, bin_dir: Option<String>, now: DateTime<Utc>) {
        if let (Some(exec), Some(dir)) = (self.exec.as_mut(), bin_dir) {
            if exec.bin.is_empty() {
                exec.bin = dir;
            }
        }
        self.set_state(ModuleState::Downloaded, now);
    }

    /// Launch requested; the process is not confirmed yet.
    pub fn begin_start(&mut self, now: DateTime<Utc>) {
        self.pid = None;
        self.awaiting_handshake = true;
        self.set_state(ModuleState::Loading, now);
    }

    pub fn record_launch(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Clears the pid if it still belongs to the exited process.
    pub fn process_exited(&mut self, pid: u32) {
        if self.pid == Some(pid) {
            self.pid = None;
        }
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>) {
        self.set_state(ModuleState::Error, now);
    }

    /// Apply an accepted handshake. The identity is only stored the first time.
    pub fn accept_handshake(
        &mut self,
        identity: String,
        port: u16,
        pid: u32,
        commands: Vec<String>,
        now: DateTime<Utc>,
    ) {
        if self.secret_hash.is_none() {
            self.secret_hash = Some(identity);
        }
        self.binding.port = port;
        if pid != 0 {
            self.pid = Some(pid);
        }
        self.custom_commands = commands;
        self.awaiting_handshake = false;
        self.set_state(ModuleState::Loading, now);
    }

    /// Optimistic Stop. Returns false, leaving the record untouched, unless Online.
    pub fn mark_stopped(&mut self, now: DateTime<Utc>) -> bool {
        if !state::can_stop(self.state) {
            return false;
        }
        self.set_state(ModuleState::Stopped, now);
        true
    }

    /// Fold one liveness result into the record.
    pub fn apply_liveness(
        &mut self,
        alive: bool,
        now: DateTime<Utc>,
        loading_timeout: Option<chrono::Duration>,
    ) -> LivenessTransition {
        let loading_expired = self.state == ModuleState::Loading
            && loading_timeout.is_some_and(|limit| now - self.state_since > limit);
        let transition = state::on_liveness(
            self.state,
            alive,
            LivenessContext {
                awaiting_handshake: self.awaiting_handshake,
                loading_expired,
            },
        );
        self.set_state(transition.next, now);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::Route;

    fn alpha() -> ModuleRecord {
        let config = ModuleConfig {
            types: "web".to_string(),
            exe: Some(ExecSpec {
                src: "./alpha".to_string(),
                main: "./alpha".to_string(),
                bin: String::new(),
            }),
            binding: Binding {
                port: 4001,
                routes: vec![Route::new("/alpha", "/")],
                ..Binding::default()
            },
            ..ModuleConfig::default()
        };
        ModuleRecord::from_config("alpha", &config)
    }

    #[test]
    fn test_types_parse() {
        assert_eq!(
            ModuleTypes::parse("web bind"),
            ModuleTypes {
                web: true,
                bind: true
            }
        );
        assert_eq!(ModuleTypes::parse(""), ModuleTypes::default());
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(alpha().endpoint("/cmd"), "http://127.0.0.1:4001/cmd");
    }

    #[test]
    fn test_secret_hash_is_set_once() {
        let mut record = alpha();
        let now = Utc::now();
        record.accept_handshake("first".to_string(), 4001, 10, vec![], now);
        record.accept_handshake("second".to_string(), 4001, 11, vec![], now);
        assert_eq!(record.secret_hash(), Some("first"));
        assert_eq!(record.pid(), Some(11));
    }

    #[test]
    fn test_start_then_handshake_then_alive() {
        let mut record = alpha();
        let now = Utc::now();
        record.begin_start(now);
        assert_eq!(record.state(), ModuleState::Loading);

        record.apply_liveness(true, now, None);
        assert_eq!(record.state(), ModuleState::Loading);

        record.accept_handshake("id".to_string(), 4001, 42, vec![], now);
        record.apply_liveness(true, now, None);
        assert_eq!(record.state(), ModuleState::Online);
    }

    #[test]
    fn test_loading_times_out() {
        let mut record = alpha();
        let start = Utc::now();
        record.begin_start(start);

        let limit = Some(chrono::Duration::seconds(5));
        let t = record.apply_liveness(false, start + chrono::Duration::seconds(1), limit);
        assert_eq!(t.next, ModuleState::Loading);

        let t = record.apply_liveness(false, start + chrono::Duration::seconds(6), limit);
        assert_eq!(t.next, ModuleState::Error);
        assert!(t.untrack);
    }

    #[test]
    fn test_launched_process_that_never_registers_times_out() {
        let mut record = alpha();
        let start = Utc::now();
        record.begin_start(start);
        record.record_launch(1234);

        let limit = Some(chrono::Duration::seconds(60));
        let t = record.apply_liveness(true, start + chrono::Duration::seconds(10), limit);
        assert_eq!(t.next, ModuleState::Loading);

        let t = record.apply_liveness(true, start + chrono::Duration::hours(1), limit);
        assert_eq!(t.next, ModuleState::Error);
        assert!(t.untrack);
        assert_eq!(record.state(), ModuleState::Error);
    }

    #[test]
    fn test_stop_requires_online() {
        let mut record = alpha();
        let now = Utc::now();
        assert!(!record.mark_stopped(now));
        assert_eq!(record.state(), ModuleState::Unknown);

        record.accept_handshake("id".to_string(), 4001, 42, vec![], now);
        record.apply_liveness(true, now, None);
        assert!(record.mark_stopped(now));
        assert_eq!(record.state(), ModuleState::Stopped);
    }

    #[test]
    fn test_process_exit_clears_matching_pid_only() {
        let mut record = alpha();
        record.record_launch(7);
        record.process_exited(8);
        assert_eq!(record.pid(), Some(7));
        record.process_exited(7);
        assert_eq!(record.pid(), None);
    }
}
