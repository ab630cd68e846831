//! Building blocks for writing a module that the hub can supervise.
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use modhub::module_kit::{ModuleContext, ModuleRuntime};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let runtime = ModuleRuntime::builder("alpha")
//!     .hub_url("http://127.0.0.1:2000/register")
//!     .secret_file(".secret")
//!     .command("Reindex", |ctx: ModuleContext| async move {
//!         Ok(format!("{} reindexed", ctx.name))
//!     })
//!     .build()
//!     .await?;
//! runtime.serve(Router::new().route("/", get(|| async { "hello" }))).await
//! # }
//! ```
pub mod commands;
pub mod runtime;

pub use commands::{CommandDispatcher, CommandHandler, CommandTable, Dispatched, ModuleContext};
pub use runtime::{ModuleRuntime, ModuleRuntimeBuilder};
