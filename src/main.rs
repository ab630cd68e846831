use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use modhub::{
    adapters::{
        ControlApiState, FileSystemAdapter, GitFetcher, HtpasswdCredentials, HttpClientAdapter,
        HttpHandler, JsonFilePersistence, LivenessChecker, LogPersistence, ShellLauncher,
        Supervisor, SysinfoProcessTable, build_router,
    },
    config::{HubConfig, HubConfigValidator, loader::load_config},
    core::{Hub, Lifecycle},
    ports::{credentials::CredentialChecker, persistence::PersistenceHook},
    protocol::{
        ControlClient,
        secret::{ensure_secret, generate_secret},
    },
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "modhub.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "modhub.yaml")]
        config: String,
    },
    /// Write an example configuration file
    Init {
        #[clap(short, long, default_value = "modhub.yaml")]
        config: String,
    },
    /// Generate a new shared secret file
    Secret {
        #[clap(short, long, default_value = ".secret")]
        output: String,
        /// Replace an existing secret
        #[clap(long)]
        force: bool,
    },
    /// Start the hub (default)
    Serve {
        #[clap(short, long, default_value = "modhub.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Secret { output, force }) => {
            return secret_command(&output, force).await;
        }
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    let config = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    tracing_setup::init_from_config(&config.logging)?;
    HubConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;

    serve(Arc::new(config)).await
}

async fn serve(config: Arc<HubConfig>) -> Result<()> {
    let secret = ensure_secret(&config.secret_path, config.generate_secret)
        .await
        .context("Failed to load the shared secret")?;

    let persistence: Arc<dyn PersistenceHook> = match &config.persistence.path {
        Some(path) => {
            tracing::info!("Persisting module records to {}", path);
            Arc::new(JsonFilePersistence::spawn(path))
        }
        None => Arc::new(LogPersistence),
    };

    let credentials: Option<Arc<dyn CredentialChecker>> = match &config.auth.credentials_path {
        Some(path) => Some(Arc::new(
            HtpasswdCredentials::load(path)
                .await
                .context("Failed to load credentials")?,
        )),
        None => None,
    };

    let hub = Arc::new(Hub::new(config.clone(), secret.clone(), persistence).await);
    let http_client = Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client")?);
    let control = Arc::new(ControlClient::new(
        http_client.clone(),
        secret,
        &config.protocol,
    ));
    let process_table = Arc::new(SysinfoProcessTable::new());

    let lifecycle = Arc::new(Lifecycle::new(
        hub.clone(),
        Arc::new(GitFetcher::new(&config.mods_dir)),
        Arc::new(ShellLauncher::new()),
        control.clone(),
    ));
    let supervisor = Supervisor::new(
        hub.clone(),
        Arc::new(LivenessChecker::new(process_table.clone(), control)),
    );
    let proxy = HttpHandler::new(
        hub.clone(),
        http_client,
        Arc::new(FileSystemAdapter::new()),
        credentials.clone(),
    );
    let app = build_router(
        ControlApiState::new(lifecycle.clone(), process_table),
        proxy,
        credentials,
    );

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    let supervisor_token = graceful_shutdown.shutdown_token();
    let supervisor_handle = tokio::spawn(async move { supervisor.run(supervisor_token).await });

    tracing::info!(
        "Hub '{}' listening on {} ({} modules, {} routes)",
        config.name,
        addr,
        hub.registry().len(),
        hub.routes().len()
    );

    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.setup_all().await });
    }

    let mut server_token = graceful_shutdown.shutdown_token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = server_token.wait_for_shutdown().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    })
    .await
    .context("Server error")?;

    match supervisor_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!("Supervisor task ended abnormally: {}", e),
    }
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match HubConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration is valid");
            println!("   Listen address: {}", config.listen_addr);
            println!("   Modules: {}", config.modules.len());
            println!(
                "   Routes: {}",
                config
                    .modules
                    .values()
                    .map(|m| m.binding.routes.len())
                    .sum::<usize>()
            );
            println!("   Supervisor interval: {}ms", config.supervisor.interval_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# modhub configuration

name: modhub
listen_addr: "127.0.0.1:2000"
secret_path: ".secret"
mods_dir: "./mods"

logging:
  level: info
  json: false

supervisor:
  interval_ms: 50
  loading_timeout_ms: 60000

protocol:
  command_path: "/cmd"
  port_range_start: 4000
  port_range_end: 4999

# persistence:
#   path: "./modhub-state.json"

# auth:
#   credentials_path: "./users.htpasswd"
#   protect_admin: true

modules:
  alpha:
    types: "web"
    exe:
      src: "./mods/alpha"
      main: "./alpha"
      bin: "./mods/alpha"
    binding:
      port: 4001
      routes:
        - from: "/alpha"
          to: "/"
          methods: ["GET", "POST"]
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created example configuration at: {config_path}");
    println!("   Run 'modhub serve --config {config_path}' to start the hub");
    Ok(())
}

/// Generate a shared secret file
async fn secret_command(output: &str, force: bool) -> Result<()> {
    if Path::new(output).exists() && !force {
        eprintln!("Error: '{output}' already exists (use --force to replace it)");
        std::process::exit(1);
    }
    generate_secret(output)
        .await
        .with_context(|| format!("Failed to write secret to {output}"))?;
    println!("Wrote a new shared secret to {output}");
    Ok(())
}
