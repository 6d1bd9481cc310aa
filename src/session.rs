//! Sessions against a version-control server.
//!
//! A [`Session`] is bound either to its own dedicated connection (remote
//! variant) or to the process-wide [`LocalClient`] (local variant). Both
//! variants share the same command execution contract: every call spawns
//! a fresh [`CommandRunner`] with the session's default context bound.

use std::sync::Arc;

use uuid::Uuid;

use crate::command::{Command, ExecContext, Response};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::local::LocalClient;
use crate::transport::{CommandRunner, Connection, Transport, TransportSession};

/// What a session is bound to.
enum Binding {
    Remote {
        identity: Identity,
        transport: Arc<dyn Transport>,
        connection: Box<dyn Connection>,
        session: Arc<dyn TransportSession>,
    },
    Local(Arc<LocalClient>),
}

/// An authenticated session with default execution context.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    identity: Option<Identity>,
    binding: Option<Binding>,
    interim: Option<Box<dyn CommandRunner>>,
    /// Outcome of the first teardown; `None` until [`Session::terminate`] runs.
    teardown: Option<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("local", &self.is_local())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Session {
    /// Creates a remote session for `identity`.
    ///
    /// Connects through the identity's gateway when one is configured,
    /// otherwise directly. Any failure surfaces as [`Error::Connection`]
    /// and no session is produced; nothing is retried.
    pub async fn create_remote(
        identity: Identity,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Self> {
        let endpoint = identity.to_string();
        let connection_error = |e: Error| Error::Connection {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        };

        let connection = match identity.gateway() {
            Some(gateway) => {
                transport
                    .connect_via_gateway(
                        gateway,
                        identity.server(),
                        identity.secure(),
                        config.api_version(),
                    )
                    .await
            }
            None => transport.connect(identity.server(), identity.secure()).await,
        }
        .map_err(connection_error)?;

        let id = Uuid::new_v4();
        let name = format!("{}/{}", config.session_prefix, id);
        let session = match connection
            .open_session(&name, identity.user(), identity.secret())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                if let Err(release_err) = connection.release().await {
                    tracing::warn!(error = %release_err, "failed to release connection after open failure");
                }
                return Err(connection_error(e));
            }
        };

        session.set_timeout(config.timeout());
        session.set_auto_reconnect(config.auto_reconnect);

        tracing::info!(
            session = %id,
            identity = %identity,
            endpoint = %connection.endpoint(),
            "created remote session"
        );

        Ok(Self {
            id,
            config,
            identity: Some(identity.clone()),
            binding: Some(Binding::Remote {
                identity,
                transport,
                connection,
                session,
            }),
            interim: None,
            teardown: None,
        })
    }

    /// Creates a session bound to the process-wide local client.
    ///
    /// The local gateway and its session are initialised at most once;
    /// later calls reuse them.
    pub async fn create_local(client: &Arc<LocalClient>) -> Result<Self> {
        client.session().await?;

        Ok(Self {
            id: Uuid::new_v4(),
            config: client.config().clone(),
            identity: None,
            binding: Some(Binding::Local(Arc::clone(client))),
            interim: None,
            teardown: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The identity of a remote session; `None` for the local variant.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.binding, Some(Binding::Local(_)))
    }

    /// The shared client behind a local session.
    pub fn local_client(&self) -> Option<&Arc<LocalClient>> {
        match &self.binding {
            Some(Binding::Local(client)) => Some(client),
            _ => None,
        }
    }

    /// True once the session has been torn down; it can never run again.
    pub fn is_terminated(&self) -> bool {
        self.binding.is_none()
    }

    fn context(&self, impersonate: Option<&str>) -> ExecContext {
        match &self.identity {
            Some(identity) => ExecContext {
                host: identity.server().host.clone(),
                port: identity.server().port,
                user: identity.user().to_string(),
                secret: identity.secret().to_string(),
                impersonate: impersonate.map(str::to_string),
            },
            None => ExecContext {
                impersonate: impersonate.map(str::to_string),
                ..Default::default()
            },
        }
    }

    async fn transport_session(&self) -> Result<Arc<dyn TransportSession>> {
        match &self.binding {
            Some(Binding::Remote { session, .. }) => Ok(Arc::clone(session)),
            Some(Binding::Local(client)) => client.session().await,
            None => Err(Error::SessionTerminated),
        }
    }

    async fn spawn_runner(&self, impersonate: Option<&str>) -> Result<Box<dyn CommandRunner>> {
        let session = self.transport_session().await?;
        let mut runner = session.create_runner()?;
        runner.set_context(&self.context(impersonate));
        Ok(runner)
    }

    async fn run_with(&self, command: &Command, impersonate: Option<&str>) -> Result<Response> {
        if self.is_terminated() {
            return Err(Error::SessionTerminated);
        }

        tracing::debug!(session = %self.id, command = %command, "running command");

        let mut runner = self
            .spawn_runner(impersonate)
            .await
            .map_err(|e| command_error(command, e))?;
        let result = runner.execute(command).await;
        if let Err(e) = runner.release().await {
            tracing::warn!(session = %self.id, error = %e, "failed to release command runner");
        }

        check_response(command, result.map_err(|e| command_error(command, e))?)
    }

    /// Runs `command` to completion.
    pub async fn run(&self, command: &Command) -> Result<Response> {
        self.run_with(command, None).await
    }

    /// Runs `command` to completion as `user`.
    pub async fn run_as(&self, command: &Command, user: &str) -> Result<Response> {
        self.run_with(command, Some(user)).await
    }

    /// Starts `command` as this session's interim run.
    ///
    /// Any prior interim run is interrupted (if unfinished) and released
    /// first. The new runner stays alive until it is waited on, replaced,
    /// or the session is terminated.
    pub async fn run_interim(&mut self, command: &Command) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::SessionTerminated);
        }

        self.release_interim().await;

        tracing::debug!(session = %self.id, command = %command, "starting interim command");

        let mut runner = self
            .spawn_runner(None)
            .await
            .map_err(|e| command_error(command, e))?;
        if let Err(e) = runner.start(command).await {
            if let Err(release_err) = runner.release().await {
                tracing::warn!(error = %release_err, "failed to release interim runner");
            }
            return Err(command_error(command, e));
        }

        self.interim = Some(runner);
        Ok(())
    }

    /// Returns true if there is no interim run or it has finished.
    pub fn interim_finished(&mut self) -> bool {
        self.interim
            .as_mut()
            .map(|runner| runner.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the interim run and returns its response.
    ///
    /// The runner is released afterwards.
    pub async fn wait_interim(&mut self, command: &Command) -> Result<Response> {
        let mut runner = self.interim.take().ok_or_else(|| Error::Command {
            command: command.to_string(),
            exit_code: None,
            message: "no interim command is running".to_string(),
        })?;

        let result = runner.wait().await;
        if let Err(e) = runner.release().await {
            tracing::warn!(session = %self.id, error = %e, "failed to release interim runner");
        }

        check_response(command, result.map_err(|e| command_error(command, e))?)
    }

    /// Interrupts and releases the interim run, if any.
    pub async fn interrupt_interim(&mut self) -> bool {
        self.release_interim().await
    }

    async fn release_interim(&mut self) -> bool {
        let Some(mut runner) = self.interim.take() else {
            return true;
        };

        let mut ok = true;
        if !runner.is_finished() {
            if let Err(e) = runner.interrupt().await {
                tracing::warn!(session = %self.id, error = %e, "failed to interrupt interim runner");
                ok = false;
            }
        }
        if let Err(e) = runner.release().await {
            tracing::warn!(session = %self.id, error = %e, "failed to release interim runner");
            ok = false;
        }
        ok
    }

    /// Runs a no-op round trip.
    pub async fn ping(&self) -> Result<()> {
        self.run(&Command::new("api", "ping")).await.map(|_| ())
    }

    /// Probes the session.
    ///
    /// Never fails: a remote session that does not answer reports
    /// not-alive, while the local variant reinitialises the local client
    /// and reports whether it answers afterwards.
    pub async fn check_liveness(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => match &self.binding {
                Some(Binding::Local(client)) => {
                    tracing::warn!(session = %self.id, error = %e, "local client not answering, reinitialising");
                    match client.reinitialize().await {
                        Ok(()) => self.ping().await.is_ok(),
                        Err(e) => {
                            tracing::warn!(error = %e, "local client reinitialisation failed");
                            false
                        }
                    }
                }
                _ => {
                    tracing::debug!(session = %self.id, error = %e, "session failed liveness probe");
                    false
                }
            },
        }
    }

    /// Tears the session down and builds it again, then pings.
    ///
    /// For the local variant the local client is reinitialised.
    pub async fn refresh(&mut self) -> Result<()> {
        match &self.binding {
            Some(Binding::Remote {
                identity,
                transport,
                ..
            }) => {
                let identity = identity.clone();
                let transport = Arc::clone(transport);
                let config = self.config.clone();

                self.terminate().await;
                *self = Session::create_remote(identity, transport, config).await?;
            }
            Some(Binding::Local(client)) => {
                let client = Arc::clone(client);
                self.release_interim().await;
                client.reinitialize().await?;
            }
            None => return Err(Error::SessionTerminated),
        }

        self.ping().await
    }

    /// Terminates the session.
    ///
    /// Each teardown step runs even if an earlier one failed; the return
    /// value is true only if all of them succeeded. The outcome is
    /// remembered: later calls do nothing and return it again, so a
    /// partial teardown keeps reporting false. The local client itself is
    /// left running; see [`LocalClient::terminate`].
    pub async fn terminate(&mut self) -> bool {
        if let Some(clean) = self.teardown {
            return clean;
        }

        let interim_released = self.release_interim().await;
        let disconnected = self.disconnect().await;

        let (session_released, connection_released) = match self.binding.take() {
            Some(Binding::Remote {
                connection,
                session,
                ..
            }) => {
                let session_released = match session.release().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(session = %self.id, error = %e, "failed to release transport session");
                        false
                    }
                };
                let connection_released = match connection.release().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(session = %self.id, error = %e, "failed to release connection");
                        false
                    }
                };
                (session_released, connection_released)
            }
            Some(Binding::Local(_)) | None => (true, true),
        };

        let clean = interim_released && disconnected && session_released && connection_released;
        self.teardown = Some(clean);

        tracing::info!(session = %self.id, clean, "terminated session");
        clean
    }

    async fn disconnect(&self) -> bool {
        let Some(identity) = &self.identity else {
            return true;
        };
        if self.is_terminated() {
            return true;
        }

        let command = Command::new("si", "disconnect")
            .flag("yes")
            .option("hostname", identity.server().host.clone())
            .option("port", identity.server().port.to_string())
            .option("user", identity.user());

        match self.run(&command).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "failed to disconnect from server");
                false
            }
        }
    }
}

/// Wraps any non-command failure as a command error for `command`.
fn command_error(command: &Command, err: Error) -> Error {
    match err {
        Error::Command { .. } | Error::SessionTerminated => err,
        other => Error::Command {
            command: command.to_string(),
            exit_code: None,
            message: other.to_string(),
        },
    }
}

fn check_response(command: &Command, response: Response) -> Result<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::Command {
            command: command.to_string(),
            exit_code: Some(response.exit_code),
            message: response.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WorkItem;
    use crate::identity::Endpoint;
    use crate::testing::ScriptedTransport;
    use crate::transport::ApiVersion;

    fn identity() -> Identity {
        Identity::new(Endpoint::new("vcs", 7001), "builder", "pw")
    }

    async fn remote(server: &Arc<ScriptedTransport>) -> Session {
        Session::create_remote(identity(), server.clone(), SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_remote_applies_timeout_and_reconnect() {
        let server = Arc::new(ScriptedTransport::new());
        let session = remote(&server).await;

        assert!(!session.is_local());
        assert_eq!(server.direct_connections(), 1);
        assert_eq!(server.last_timeout(), Some(SessionConfig::default().timeout()));
        assert!(server.auto_reconnect_enabled());
        assert!(server
            .last_session_name()
            .unwrap()
            .starts_with(&SessionConfig::default().session_prefix));
    }

    #[tokio::test]
    async fn create_remote_routes_through_gateway() {
        let server = Arc::new(ScriptedTransport::new());
        let identity = identity().with_gateway(Endpoint::new("ip", 7002));

        Session::create_remote(identity, server.clone(), SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(server.gateway_connections(), 1);
        assert_eq!(server.direct_connections(), 0);
        assert_eq!(
            server.last_api_version(),
            Some(ApiVersion { major: 4, minor: 16 })
        );
    }

    #[tokio::test]
    async fn create_remote_failure_is_connection_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_connections(true);

        let err = Session::create_remote(identity(), server.clone(), SessionConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn open_failure_releases_connection() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_session_open(true);

        let err = Session::create_remote(identity(), server.clone(), SessionConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(server.connections_released(), 1);
    }

    #[tokio::test]
    async fn run_binds_default_context() {
        let server = Arc::new(ScriptedTransport::new());
        let session = remote(&server).await;

        session.run(&Command::new("api", "ping")).await.unwrap();

        let (_, context) = server.journal().pop().unwrap();
        assert_eq!(context.host, "vcs");
        assert_eq!(context.user, "builder");
        assert_eq!(context.impersonate, None);
        assert_eq!(server.live_runners(), 0);
    }

    #[tokio::test]
    async fn run_as_binds_impersonation() {
        let server = Arc::new(ScriptedTransport::new());
        let session = remote(&server).await;

        session
            .run_as(&Command::new("si", "viewsandbox"), "release")
            .await
            .unwrap();

        let (_, context) = server.journal().pop().unwrap();
        assert_eq!(context.impersonate.as_deref(), Some("release"));
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_command_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::failed(128, "not a sandbox"));
        let session = remote(&server).await;

        let err = session
            .run(&Command::new("si", "sandboxinfo"))
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(128));
        assert!(err.to_string().contains("si sandboxinfo"));
    }

    #[tokio::test]
    async fn transport_failure_becomes_command_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_command("si resync");
        let session = remote(&server).await;

        let err = session.run(&Command::new("si", "resync")).await.unwrap_err();

        assert!(err.is_command());
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_blocks_commands() {
        let server = Arc::new(ScriptedTransport::new());
        let mut session = remote(&server).await;

        assert!(session.terminate().await);
        assert!(session.is_terminated());
        assert_eq!(server.disconnects(), 1);

        assert!(session.terminate().await);
        assert_eq!(server.disconnects(), 1);
        assert_eq!(server.sessions_released(), 1);
        assert_eq!(server.connections_released(), 1);

        assert!(matches!(
            session.run(&Command::new("api", "ping")).await,
            Err(Error::SessionTerminated)
        ));
        assert!(matches!(
            session.run_interim(&Command::new("si", "resync")).await,
            Err(Error::SessionTerminated)
        ));
        assert!(matches!(
            session.run_as(&Command::new("api", "ping"), "x").await,
            Err(Error::SessionTerminated)
        ));
    }

    #[tokio::test]
    async fn terminate_continues_after_disconnect_failure() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_command("si disconnect");
        let mut session = remote(&server).await;

        assert!(!session.terminate().await);
        assert!(session.is_terminated());
        assert_eq!(server.sessions_released(), 1);
        assert_eq!(server.connections_released(), 1);

        // A partial teardown stays partial; nothing is torn down twice.
        assert!(!session.terminate().await);
        assert_eq!(server.disconnects(), 1);
        assert_eq!(server.sessions_released(), 1);
    }

    #[tokio::test]
    async fn interim_run_replaces_unfinished_predecessor() {
        let server = Arc::new(ScriptedTransport::new());
        server.hold_interim(true);
        let mut session = remote(&server).await;

        session
            .run_interim(&Command::new("si", "resync"))
            .await
            .unwrap();
        assert!(!session.interim_finished());

        session
            .run_interim(&Command::new("si", "viewsandbox"))
            .await
            .unwrap();

        assert_eq!(server.interrupts(), 1);
        assert_eq!(server.live_runners(), 1);
    }

    #[tokio::test]
    async fn wait_interim_returns_response() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond(
            "si resync",
            Response::ok(vec![WorkItem::new("a.c").with_result("Resynced")]),
        );
        let mut session = remote(&server).await;
        let cmd = Command::new("si", "resync");

        session.run_interim(&cmd).await.unwrap();
        let response = session.wait_interim(&cmd).await.unwrap();

        assert_eq!(response.items.len(), 1);
        assert!(session.interim_finished());
        assert_eq!(server.live_runners(), 0);
    }

    #[tokio::test]
    async fn terminate_interrupts_live_interim() {
        let server = Arc::new(ScriptedTransport::new());
        server.hold_interim(true);
        let mut session = remote(&server).await;

        session
            .run_interim(&Command::new("si", "resync"))
            .await
            .unwrap();

        assert!(session.terminate().await);
        assert_eq!(server.interrupts(), 1);
        assert_eq!(server.live_runners(), 0);
    }

    #[tokio::test]
    async fn refresh_reconnects_and_pings() {
        let server = Arc::new(ScriptedTransport::new());
        let mut session = remote(&server).await;
        let first_id = session.id();

        session.refresh().await.unwrap();

        assert_ne!(session.id(), first_id);
        assert!(!session.is_terminated());
        assert_eq!(server.direct_connections(), 2);
        assert_eq!(server.count("api ping"), 1);
    }

    #[tokio::test]
    async fn remote_liveness_reports_dead_session() {
        let server = Arc::new(ScriptedTransport::new());
        let session = remote(&server).await;
        assert!(session.check_liveness().await);

        server.fail_command("api ping");
        assert!(!session.check_liveness().await);
    }
}
