pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod module;
pub mod registry;
pub mod route_table;
pub mod state;
pub mod tracked;

pub use error::{HandshakeError, LifecycleError};
pub use hub::Hub;
pub use lifecycle::Lifecycle;
pub use module::{ModuleRecord, ModuleTypes};
pub use registry::ModuleRegistry;
pub use route_table::{RouteMatch, RouteTable};
pub use state::ModuleState;
pub use tracked::TrackedSet;
