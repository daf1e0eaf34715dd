//! Client side of the crucible execution service: the HTTP session client,
//! the supervisor that launches or attaches to the service, and the
//! provider façade that ties them together for the agent layer.

mod client;
mod error;
mod provider;
mod supervisor;

pub use client::ClientConfig;
pub use client::DEFAULT_REQUEST_TIMEOUT;
pub use client::OnOutput;
pub use client::SessionClient;
pub use error::ClientErr;
pub use error::Result;
pub use error::SupervisorError;
pub use provider::ProviderConfig;
pub use provider::ServiceProvider;
pub use supervisor::LaunchMode;
pub use supervisor::ServerSupervisor;
pub use supervisor::SupervisorConfig;
