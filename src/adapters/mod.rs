pub mod control_api;
pub mod credentials;
pub mod file_system;
pub mod http_client;
pub mod http_handler;
pub mod liveness;
pub mod middleware;
pub mod persistence;
pub mod process;
pub mod supervisor;

/// Re-export commonly used types from adapters
pub use control_api::{ControlApiState, build_router};
pub use credentials::HtpasswdCredentials;
pub use file_system::FileSystemAdapter;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use liveness::LivenessChecker;
pub use middleware::*;
pub use persistence::{JsonFilePersistence, LogPersistence};
pub use process::{GitFetcher, ShellLauncher, SysinfoProcessTable};
pub use supervisor::Supervisor;
