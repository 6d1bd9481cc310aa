//! Transport seam between sessions and the version-control server.
//!
//! A [`Transport`] is the connection factory. It hands out [`Connection`]s
//! (direct, through an integration point gateway, or to the local client),
//! connections open named [`TransportSession`]s, and sessions spawn
//! disposable [`CommandRunner`]s, one per command invocation.
//!
//! The [`CliTransport`] implementation drives the server's command-line
//! client; tests use [`crate::testing::ScriptedTransport`].

mod cli;

pub use cli::CliTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{Command, ExecContext, Response};
use crate::error::Result;
use crate::identity::Endpoint;

/// Protocol version requested when connecting through a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Factory for connections to a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects directly to `server`.
    async fn connect(&self, server: &Endpoint, secure: bool) -> Result<Box<dyn Connection>>;

    /// Connects to `server` through the integration point at `gateway`.
    async fn connect_via_gateway(
        &self,
        gateway: &Endpoint,
        server: &Endpoint,
        secure: bool,
        version: ApiVersion,
    ) -> Result<Box<dyn Connection>>;

    /// Starts (if needed) and connects to the local client gateway.
    async fn start_local_gateway(&self) -> Result<Box<dyn Connection>>;
}

/// An authenticated transport handle to one endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable endpoint description for diagnostics.
    fn endpoint(&self) -> String;

    /// Opens a named session. Empty credentials select the client's defaults.
    async fn open_session(
        &self,
        name: &str,
        user: &str,
        secret: &str,
    ) -> Result<Arc<dyn TransportSession>>;

    /// Releases the connection back to its factory.
    async fn release(&self) -> Result<()>;
}

/// A named session on a connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn set_timeout(&self, timeout: Duration);

    fn set_auto_reconnect(&self, enabled: bool);

    /// Spawns a fresh runner for one command invocation.
    fn create_runner(&self) -> Result<Box<dyn CommandRunner>>;

    /// Releases the session on the server.
    async fn release(&self) -> Result<()>;
}

/// A disposable execution context for one command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Binds the default host, port, credentials and impersonation target.
    fn set_context(&mut self, context: &ExecContext);

    /// Runs `command` to completion.
    async fn execute(&mut self, command: &Command) -> Result<Response>;

    /// Starts `command` without waiting for it to finish.
    async fn start(&mut self, command: &Command) -> Result<()>;

    /// Waits for a started command and collects its response.
    async fn wait(&mut self) -> Result<Response>;

    /// Returns true once a started command has finished (or none was started).
    fn is_finished(&mut self) -> bool;

    /// Interrupts a started command.
    async fn interrupt(&mut self) -> Result<()>;

    /// Releases the runner; it must not be used afterwards.
    async fn release(&mut self) -> Result<()>;
}
