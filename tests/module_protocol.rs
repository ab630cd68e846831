// End-to-end: a module built with the module kit registers with a live hub, is
// supervised, proxied to and stopped over real loopback sockets
#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{Router, body::Body, routing::get};
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use modhub::{
        adapters::{
            ControlApiState, FileSystemAdapter, GitFetcher, HttpClientAdapter, HttpHandler,
            LivenessChecker, LogPersistence, ShellLauncher, Supervisor, SysinfoProcessTable,
            build_router,
        },
        config::models::{BindingConfig, HubConfig, ModuleConfig, ProtocolConfig, Route},
        core::{Hub, Lifecycle, ModuleRecord, ModuleState},
        module_kit::{ModuleContext, ModuleRuntime},
        ports::http_client::HttpClient,
        protocol::{ControlClient, SecretToken},
    };
    use tokio::net::TcpListener;

    const SECRET: &[u8] = b"end to end secret";

    async fn body_text(response: http::Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_module_lifecycle_over_loopback() {
        // hub
        let config = HubConfig::builder()
            .listen_addr("127.0.0.1:0")
            .protocol(ProtocolConfig {
                request_timeout_ms: 500,
                ..ProtocolConfig::default()
            })
            .module(
                "alpha",
                ModuleConfig {
                    types: "web".to_string(),
                    binding: BindingConfig {
                        routes: vec![Route::new("/alpha", "/")],
                        ..BindingConfig::default()
                    },
                    ..ModuleConfig::default()
                },
            )
            .build()
            .unwrap();
        let secret = SecretToken::derive(SECRET);
        let hub = Arc::new(
            Hub::new(Arc::new(config), secret.clone(), Arc::new(LogPersistence)).await,
        );
        let http = Arc::new(HttpClientAdapter::new().unwrap());
        let control = Arc::new(ControlClient::new(
            http.clone(),
            secret,
            &hub.config().protocol,
        ));
        let process_table = Arc::new(SysinfoProcessTable::new());
        let lifecycle = Arc::new(Lifecycle::new(
            hub.clone(),
            Arc::new(GitFetcher::new("./mods")),
            Arc::new(ShellLauncher::new()),
            control.clone(),
        ));
        let supervisor = Supervisor::new(
            hub.clone(),
            Arc::new(LivenessChecker::new(process_table.clone(), control.clone())),
        );
        let proxy = HttpHandler::new(
            hub.clone(),
            http.clone(),
            Arc::new(FileSystemAdapter::new()),
            None,
        );
        let app = build_router(
            ControlApiState::new(lifecycle.clone(), process_table),
            proxy,
            None,
        );
        let hub_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_addr = hub_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                hub_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });

        // module
        let module_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let module_port = module_listener.local_addr().unwrap().port();
        let runtime = ModuleRuntime::builder("alpha")
            .hub_url(format!("http://{hub_addr}/register"))
            .secret_token(SecretToken::derive(SECRET))
            .port(module_port)
            .shutdown_grace(Duration::from_millis(100))
            .command("Reindex", |ctx: ModuleContext| async move {
                Ok(format!("{} reindexed", ctx.name))
            })
            .build()
            .await
            .unwrap();

        assert_eq!(runtime.connect_to_hub().await.unwrap(), module_port);
        let record = hub.registry().get("alpha").await.unwrap();
        assert_eq!(record.state(), ModuleState::Loading);
        assert_eq!(record.custom_commands(), ["Reindex".to_string()]);

        let module_app = Router::new().route("/", get(|| async { "hello from alpha" }));
        let module_task = tokio::spawn(runtime.serve_on(module_listener, module_app));

        // supervision confirms the module over the control protocol
        supervisor.tick().await;
        assert_eq!(
            hub.registry().get("alpha").await.unwrap().state(),
            ModuleState::Online
        );

        // proxied through the hub's public listener
        let req = Request::builder()
            .uri(format!("http://{hub_addr}/alpha"))
            .body(Body::empty())
            .unwrap();
        let response = http.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello from alpha");

        // custom command relay through the admin API
        let req = Request::builder()
            .method("POST")
            .uri(format!("http://{hub_addr}/hub/modules/alpha/command/Reindex"))
            .body(Body::empty())
            .unwrap();
        let response = http.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("alpha reindexed"));

        // stop: reply first, listener closes after the grace period
        let reply = lifecycle.stop("alpha").await.unwrap();
        assert_eq!(reply.message, "SHUTTING DOWN alpha");
        assert_eq!(
            hub.registry().get("alpha").await.unwrap().state(),
            ModuleState::Stopped
        );

        let finished = tokio::time::timeout(Duration::from_secs(5), module_task).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));

        let record: Arc<ModuleRecord> = hub.registry().get("alpha").await.unwrap();
        assert!(control.ping(&record).await.is_err());

        // confirmed loss settles the stopped module
        supervisor.tick().await;
        assert_eq!(
            hub.registry().get("alpha").await.unwrap().state(),
            ModuleState::Unknown
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handshake_with_wrong_secret_is_refused() {
        let config = HubConfig::builder()
            .listen_addr("127.0.0.1:0")
            .build()
            .unwrap();
        let hub = Arc::new(
            Hub::new(
                Arc::new(config),
                SecretToken::derive(SECRET),
                Arc::new(LogPersistence),
            )
            .await,
        );
        let http = Arc::new(HttpClientAdapter::new().unwrap());
        let control = Arc::new(ControlClient::new(
            http.clone(),
            SecretToken::derive(SECRET),
            &hub.config().protocol,
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            hub.clone(),
            Arc::new(GitFetcher::new("./mods")),
            Arc::new(ShellLauncher::new()),
            control,
        ));
        let proxy = HttpHandler::new(hub.clone(), http, Arc::new(FileSystemAdapter::new()), None);
        let app = build_router(
            ControlApiState::new(lifecycle, Arc::new(SysinfoProcessTable::new())),
            proxy,
            None,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let runtime = ModuleRuntime::builder("mallory")
            .hub_url(format!("http://{addr}/register"))
            .secret_token(SecretToken::derive(b"guessed"))
            .build()
            .await
            .unwrap();

        assert!(runtime.connect_to_hub().await.is_err());
        assert!(hub.registry().get("mallory").await.is_none());
    }
}
