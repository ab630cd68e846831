//! Lifecycle operations on managed modules: setup (fetch + start), start, stop and
//! custom command relay. Every state write happens under the record's write lock.
use std::{path::Path, sync::Arc};

use chrono::Utc;

use crate::{
    config::models::ExecSpec,
    core::{
        error::LifecycleError,
        hub::Hub,
        registry::RecordGuard,
        state::{self, ModuleState},
    },
    ports::process::{ModuleLauncher, SourceFetcher},
    protocol::{ControlClient, messages::CommandReply},
};

/// File name of the secret copy placed next to a managed module
pub const MODULE_SECRET_FILE: &str = ".secret";

pub struct Lifecycle {
    hub: Arc<Hub>,
    fetcher: Arc<dyn SourceFetcher>,
    launcher: Arc<dyn ModuleLauncher>,
    control: Arc<ControlClient>,
}

impl Lifecycle {
    pub fn new(
        hub: Arc<Hub>,
        fetcher: Arc<dyn SourceFetcher>,
        launcher: Arc<dyn ModuleLauncher>,
        control: Arc<ControlClient>,
    ) -> Self {
        Self {
            hub,
            fetcher,
            launcher,
            control,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    async fn lock(&self, name: &str) -> Result<RecordGuard, LifecycleError> {
        self.hub
            .registry()
            .lock(name)
            .await
            .ok_or_else(|| LifecycleError::UnknownModule(name.to_string()))
    }

    /// Fetch the module when its source is remote, provision the secret and start it.
    /// A fetch failure puts the module in Error and nothing is launched.
    pub async fn setup(&self, name: &str) -> Result<(), LifecycleError> {
        let guard = self.lock(name).await?;
        let record = guard.record();
        let Some(exec) = record.exec.clone() else {
            tracing::info!("Module '{}' has no managed process, nothing to set up", name);
            return Ok(());
        };

        if exec.is_remote() {
            if record.state() == ModuleState::Online {
                return Err(LifecycleError::Busy(name.to_string()));
            }
            match self.fetcher.fetch(name, &exec).await {
                Ok(dir) => {
                    let dir = dir.to_string_lossy().into_owned();
                    let (_, record) = guard.update(|r| r.mark_downloaded(Some(dir), Utc::now()));
                    self.hub.persist(&record);
                    tracing::info!("Module '{}' downloaded", name);
                }
                Err(e) => {
                    let (_, record) = guard.update(|r| r.mark_error(Utc::now()));
                    self.hub.persist(&record);
                    tracing::error!("Fetching module '{}' failed: {}", name, e);
                    return Err(LifecycleError::FetchFailure {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        let exec = guard.record().exec.clone().unwrap_or(exec);
        drop(guard);

        self.provision_secret(&exec).await?;
        self.start(name).await
    }

    /// Set up every configured module with a managed process. Failures are logged and
    /// do not prevent the other modules from starting.
    pub async fn setup_all(&self) {
        for record in self.hub.registry().snapshot_all().await {
            if !record.is_managed() {
                continue;
            }
            if let Err(e) = self.setup(&record.name).await {
                tracing::error!("Setup of module '{}' failed: {}", record.name, e);
            }
        }
    }

    /// Copy the hub's secret file into the module's working directory.
    async fn provision_secret(&self, exec: &ExecSpec) -> Result<(), LifecycleError> {
        if exec.bin.is_empty() {
            return Ok(());
        }
        let target = Path::new(&exec.bin).join(MODULE_SECRET_FILE);
        let source = Path::new(&self.hub.config().secret_path);
        if source == target {
            return Ok(());
        }
        tokio::fs::create_dir_all(&exec.bin).await?;
        tokio::fs::copy(source, &target).await?;
        tracing::debug!("Provisioned secret at {}", target.display());
        Ok(())
    }

    /// Mark the module Loading, launch its process and reap it in the background.
    /// A launch failure puts the module in Error. Refused while Online or Loading.
    pub async fn start(&self, name: &str) -> Result<(), LifecycleError> {
        let guard = self.lock(name).await?;
        let current = guard.record();
        let exec = current
            .exec
            .clone()
            .ok_or_else(|| LifecycleError::NotManaged(name.to_string()))?;
        if matches!(current.state(), ModuleState::Online | ModuleState::Loading) {
            return Err(LifecycleError::Busy(name.to_string()));
        }
        let (_, record) = guard.update(|r| r.begin_start(Utc::now()));
        drop(guard);

        self.hub.persist(&record);
        self.hub.tracked().add(name);
        tracing::info!("Starting module '{}': {}", name, exec.main);

        let process = match self.launcher.launch(name, &exec).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("Launching module '{}' failed: {}", name, e);
                if let Some(guard) = self.hub.registry().lock(name).await {
                    let (_, record) = guard.update(|r| r.mark_error(Utc::now()));
                    self.hub.persist(&record);
                }
                self.hub.tracked().remove(name);
                return Err(LifecycleError::ProcessLaunchFailure {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let pid = process.pid;
        if let Some(guard) = self.hub.registry().lock(name).await {
            let (_, record) = guard.update(|r| r.record_launch(pid));
            self.hub.persist(&record);
        }
        tracing::info!("Module '{}' launched with pid {}", name, pid);

        if let Some(exited) = process.exited {
            let hub = self.hub.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let code = exited.await.ok().flatten();
                tracing::info!("Module '{}' (pid {}) exited with {:?}", name, pid, code);
                if let Some(guard) = hub.registry().lock(&name).await {
                    let (_, record) = guard.update(|r| r.process_exited(pid));
                    hub.persist(&record);
                }
            });
        }

        Ok(())
    }

    /// Send Shutdown and mark the module Stopped. Only an Online module can be stopped;
    /// the state is Stopped even when the module could not be reached, the supervisor
    /// settles it afterwards.
    pub async fn stop(&self, name: &str) -> Result<CommandReply, LifecycleError> {
        let guard = self.lock(name).await?;
        let record = guard.record();
        if !state::can_stop(record.state()) {
            return Err(LifecycleError::NotRunning {
                name: name.to_string(),
                state: record.state(),
            });
        }

        let reply = self.control.shutdown(&record).await;
        let (_, record) = guard.update(|r| r.mark_stopped(Utc::now()));
        drop(guard);
        self.hub.persist(&record);

        match reply {
            Ok(reply) => {
                tracing::info!("Module '{}' stopping: {}", name, reply.message);
                Ok(reply)
            }
            Err(e) => {
                tracing::warn!("Shutdown of module '{}' not delivered: {}", name, e);
                Err(LifecycleError::Unreachable {
                    name: name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Relay a command to an Online module.
    pub async fn command(&self, name: &str, command: &str) -> Result<CommandReply, LifecycleError> {
        let record = self
            .hub
            .registry()
            .get(name)
            .await
            .ok_or_else(|| LifecycleError::UnknownModule(name.to_string()))?;
        if record.state() != ModuleState::Online {
            return Err(LifecycleError::NotRunning {
                name: name.to_string(),
                state: record.state(),
            });
        }
        self.control
            .send_command(&record, command)
            .await
            .map_err(|source| LifecycleError::Unreachable {
                name: name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use bytes::Bytes;
    use http::StatusCode;
    use hyper::{Request, Response};
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        adapters::LogPersistence,
        config::models::{HubConfig, ModuleConfig, ProtocolConfig},
        ports::{
            http_client::{HttpClient, HttpClientError, HttpClientResult, RawResponse},
            process::{LaunchedProcess, ProcessError},
        },
        protocol::SecretToken,
    };

    struct StubFetcher {
        fail: bool,
        into: PathBuf,
    }

    impl StubFetcher {
        fn ok(into: PathBuf) -> Self {
            Self { fail: false, into }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                into: PathBuf::new(),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for StubFetcher {
        async fn fetch(&self, name: &str, _exec: &ExecSpec) -> Result<PathBuf, ProcessError> {
            if self.fail {
                Err(ProcessError::Fetch("repository not found".to_string()))
            } else {
                Ok(self.into.join(name))
            }
        }
    }

    #[derive(Default)]
    struct StubLauncher {
        fail: bool,
        launched: Mutex<Vec<String>>,
        exit: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    }

    #[async_trait]
    impl ModuleLauncher for StubLauncher {
        async fn launch(
            &self,
            name: &str,
            _exec: &ExecSpec,
        ) -> Result<LaunchedProcess, ProcessError> {
            if self.fail {
                return Err(ProcessError::Launch("no such file".to_string()));
            }
            self.launched.lock().unwrap().push(name.to_string());
            let (tx, rx) = oneshot::channel();
            *self.exit.lock().unwrap() = Some(tx);
            Ok(LaunchedProcess {
                pid: 4242,
                exited: Some(rx),
            })
        }
    }

    /// Answers every control call with a fixed reply, or refuses the connection
    struct StubControl {
        reply: Option<(StatusCode, &'static str)>,
    }

    #[async_trait]
    impl HttpClient for StubControl {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::ConnectionError("not used".to_string()))
        }

        async fn post_bytes(
            &self,
            _url: &str,
            _body: Bytes,
            _timeout: Duration,
        ) -> HttpClientResult<RawResponse> {
            match self.reply {
                Some((status, body)) => Ok(RawResponse {
                    status,
                    body: Bytes::from_static(body.as_bytes()),
                }),
                None => Err(HttpClientError::ConnectionError("refused".to_string())),
            }
        }
    }

    fn managed(src: &str) -> ModuleConfig {
        ModuleConfig {
            types: "web".to_string(),
            exe: Some(ExecSpec {
                src: src.to_string(),
                main: "./alpha".to_string(),
                bin: String::new(),
            }),
            ..ModuleConfig::default()
        }
    }

    async fn lifecycle_with(
        module: ModuleConfig,
        fetcher: StubFetcher,
        launcher: Arc<StubLauncher>,
        reply: Option<(StatusCode, &'static str)>,
    ) -> Lifecycle {
        lifecycle_with_secret(module, fetcher, launcher, reply, ".secret").await
    }

    async fn lifecycle_with_secret(
        module: ModuleConfig,
        fetcher: StubFetcher,
        launcher: Arc<StubLauncher>,
        reply: Option<(StatusCode, &'static str)>,
        secret_path: &str,
    ) -> Lifecycle {
        let config = HubConfig::builder()
            .listen_addr("127.0.0.1:2000")
            .secret_path(secret_path)
            .module("alpha", module)
            .build()
            .unwrap();
        let secret = SecretToken::derive(b"s");
        let hub = Arc::new(Hub::new(Arc::new(config), secret.clone(), Arc::new(LogPersistence)).await);
        let control = Arc::new(ControlClient::new(
            Arc::new(StubControl { reply }),
            secret,
            &ProtocolConfig::default(),
        ));
        Lifecycle::new(hub, Arc::new(fetcher), launcher, control)
    }

    async fn record(lifecycle: &Lifecycle) -> Arc<crate::core::ModuleRecord> {
        lifecycle.hub().registry().get("alpha").await.unwrap()
    }

    async fn force_online(lifecycle: &Lifecycle) {
        let guard = lifecycle.hub().registry().lock("alpha").await.unwrap();
        guard.update(|r| {
            r.accept_handshake("id".to_string(), 4001, 0, vec![], Utc::now());
            r.apply_liveness(true, Utc::now(), None);
        });
    }

    #[tokio::test]
    async fn test_setup_remote_fetches_then_starts() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("hub.secret");
        tokio::fs::write(&secret_path, b"s").await.unwrap();
        let mods = dir.path().join("mods");

        let launcher = Arc::new(StubLauncher::default());
        let lifecycle = lifecycle_with_secret(
            managed("https://example.com/alpha.git"),
            StubFetcher::ok(mods.clone()),
            launcher.clone(),
            None,
            secret_path.to_str().unwrap(),
        )
        .await;

        lifecycle.setup("alpha").await.unwrap();
        let record = record(&lifecycle).await;
        assert_eq!(record.state(), ModuleState::Loading);
        assert_eq!(
            PathBuf::from(&record.exec.as_ref().unwrap().bin),
            mods.join("alpha")
        );
        assert_eq!(launcher.launched.lock().unwrap().as_slice(), ["alpha"]);

        let copied = tokio::fs::read(mods.join("alpha").join(MODULE_SECRET_FILE))
            .await
            .unwrap();
        assert_eq!(copied, b"s");
    }

    #[tokio::test]
    async fn test_fetch_failure_halts_setup() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle = lifecycle_with(
            managed("https://example.com/alpha.git"),
            StubFetcher::failing(),
            launcher.clone(),
            None,
        )
        .await;

        let result = lifecycle.setup("alpha").await;
        assert!(matches!(result, Err(LifecycleError::FetchFailure { .. })));
        assert_eq!(record(&lifecycle).await.state(), ModuleState::Error);
        assert!(launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_tracks_and_reaps() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle =
            lifecycle_with(managed("./local"), StubFetcher::ok(PathBuf::new()), launcher.clone(), None)
                .await;

        lifecycle.setup("alpha").await.unwrap();
        let started = record(&lifecycle).await;
        assert_eq!(started.state(), ModuleState::Loading);
        assert_eq!(started.pid(), Some(4242));
        assert!(started.awaiting_handshake());
        assert!(lifecycle.hub().tracked().contains("alpha"));

        let exit = launcher.exit.lock().unwrap().take().unwrap();
        exit.send(Some(0)).unwrap();
        for _ in 0..50 {
            if record(&lifecycle).await.pid().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record(&lifecycle).await.pid(), None);
    }

    #[tokio::test]
    async fn test_launch_failure_sets_error() {
        let launcher = Arc::new(StubLauncher {
            fail: true,
            ..StubLauncher::default()
        });
        let lifecycle =
            lifecycle_with(managed("./local"), StubFetcher::ok(PathBuf::new()), launcher, None).await;

        let result = lifecycle.start("alpha").await;
        assert!(matches!(result, Err(LifecycleError::ProcessLaunchFailure { .. })));
        assert_eq!(record(&lifecycle).await.state(), ModuleState::Error);
        assert!(!lifecycle.hub().tracked().contains("alpha"));
    }

    #[tokio::test]
    async fn test_start_refused_while_running() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle =
            lifecycle_with(managed("./local"), StubFetcher::ok(PathBuf::new()), launcher.clone(), None)
                .await;

        lifecycle.start("alpha").await.unwrap();
        let result = lifecycle.start("alpha").await;
        assert!(matches!(result, Err(LifecycleError::Busy(_))));
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(record(&lifecycle).await.pid(), Some(4242));

        force_online(&lifecycle).await;
        let result = lifecycle.start("alpha").await;
        assert!(matches!(result, Err(LifecycleError::Busy(_))));
        let online = record(&lifecycle).await;
        assert_eq!(online.state(), ModuleState::Online);
        assert!(!online.awaiting_handshake());
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_requires_online() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle = lifecycle_with(
            managed("./local"),
            StubFetcher::ok(PathBuf::new()),
            launcher,
            Some((StatusCode::OK, "SHUTTING DOWN alpha")),
        )
        .await;

        let result = lifecycle.stop("alpha").await;
        assert!(matches!(
            result,
            Err(LifecycleError::NotRunning {
                state: ModuleState::Unknown,
                ..
            })
        ));

        force_online(&lifecycle).await;
        let reply = lifecycle.stop("alpha").await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.message, "SHUTTING DOWN alpha");
        assert_eq!(record(&lifecycle).await.state(), ModuleState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_stop_still_marks_stopped() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle =
            lifecycle_with(managed("./local"), StubFetcher::ok(PathBuf::new()), launcher, None).await;
        force_online(&lifecycle).await;

        let result = lifecycle.stop("alpha").await;
        assert!(matches!(result, Err(LifecycleError::Unreachable { .. })));
        assert_eq!(record(&lifecycle).await.state(), ModuleState::Stopped);
    }

    #[tokio::test]
    async fn test_command_relay() {
        let launcher = Arc::new(StubLauncher::default());
        let lifecycle = lifecycle_with(
            managed("./local"),
            StubFetcher::ok(PathBuf::new()),
            launcher,
            Some((StatusCode::NOT_FOUND, "Unknown command Reload")),
        )
        .await;

        assert!(matches!(
            lifecycle.command("ghost", "Reload").await,
            Err(LifecycleError::UnknownModule(_))
        ));
        assert!(matches!(
            lifecycle.command("alpha", "Reload").await,
            Err(LifecycleError::NotRunning { .. })
        ));

        force_online(&lifecycle).await;
        let reply = lifecycle.command("alpha", "Reload").await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.code, 404);
    }
}
