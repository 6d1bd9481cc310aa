//! Process-wide local client gateway and session.
//!
//! The local client is started lazily, exactly once, the first time any
//! caller asks for it. Concurrent first-time callers serialise on an
//! initialisation lock; once initialised, lookups only clone an `Arc`.
//! The gateway lives until process exit. The session can be torn down with
//! [`LocalClient::terminate`] and is rebuilt on next use.

use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::transport::{Connection, Transport, TransportSession};

/// Installed process-wide instance.
static GLOBAL: OnceLock<Arc<LocalClient>> = OnceLock::new();

/// Lazily initialised local gateway plus session.
pub struct LocalClient {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    gateway: OnceCell<Box<dyn Connection>>,
    session: RwLock<Option<Arc<dyn TransportSession>>>,
    init: Mutex<()>,
}

impl LocalClient {
    /// Creates an uninitialised local client.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            gateway: OnceCell::new(),
            session: RwLock::new(None),
            init: Mutex::new(()),
        }
    }

    /// Installs `client` as the process-wide instance.
    ///
    /// The first installed client wins; later calls return it unchanged.
    pub fn install_global(client: LocalClient) -> Arc<LocalClient> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(client)))
    }

    /// Returns the process-wide instance, if one was installed.
    pub fn global() -> Option<Arc<LocalClient>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True once the local session exists.
    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<dyn TransportSession>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns the local session, initialising the gateway and session on
    /// first use.
    pub async fn session(&self) -> Result<Arc<dyn TransportSession>> {
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let _guard = self.init.lock().await;
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let gateway = self
            .gateway
            .get_or_try_init(|| async { self.transport.start_local_gateway().await })
            .await
            .map_err(|e| Error::Connection {
                endpoint: "local client".to_string(),
                reason: e.to_string(),
            })?;

        let name = format!("{}/local/{}", self.config.session_prefix, Uuid::new_v4());
        let session = gateway
            .open_session(&name, "", "")
            .await
            .map_err(|e| Error::Connection {
                endpoint: gateway.endpoint(),
                reason: e.to_string(),
            })?;
        session.set_timeout(self.config.timeout());
        session.set_auto_reconnect(true);

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&session));

        tracing::info!(endpoint = %gateway.endpoint(), session = %name, "initialised local client session");
        Ok(session)
    }

    /// Drops the current local session and builds a new one.
    pub async fn reinitialize(&self) -> Result<()> {
        {
            let _guard = self.init.lock().await;
            self.release_current().await;
        }
        self.session().await.map(|_| ())
    }

    /// Releases the local session; the next use initialises a new one.
    ///
    /// Returns false if the release step failed.
    pub async fn terminate(&self) -> bool {
        let _guard = self.init.lock().await;
        self.release_current().await
    }

    async fn release_current(&self) -> bool {
        let previous = self
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match previous {
            Some(session) => match session.release().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to release local client session");
                    false
                }
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::session::Session;
    use crate::testing::ScriptedTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_first_use_creates_one_gateway_and_session() {
        let server = Arc::new(ScriptedTransport::new());
        server.set_connect_delay(Duration::from_millis(20));
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                Session::create_local(&client).await.map(|s| s.is_local())
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        assert_eq!(server.local_gateways_started(), 1);
        assert_eq!(server.sessions_opened(), 1);
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn local_sessions_share_the_client() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));

        let a = Session::create_local(&client).await.unwrap();
        let b = Session::create_local(&client).await.unwrap();
        a.run(&Command::new("api", "ping")).await.unwrap();
        b.run(&Command::new("api", "ping")).await.unwrap();

        assert_eq!(server.sessions_opened(), 1);
        assert!(a.identity().is_none());
        let (_, context) = server.journal().pop().unwrap();
        assert!(context.host.is_empty());
    }

    #[tokio::test]
    async fn liveness_failure_reinitialises_local_session() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        let session = Session::create_local(&client).await.unwrap();

        server.fail_command("api ping");
        assert!(!session.check_liveness().await);
        assert_eq!(server.sessions_opened(), 2);
        assert_eq!(server.local_gateways_started(), 1);

        server.clear_failures();
        assert!(session.check_liveness().await);
    }

    #[tokio::test]
    async fn terminating_a_local_session_keeps_the_client() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        let mut session = Session::create_local(&client).await.unwrap();

        assert!(session.terminate().await);
        assert!(session.is_terminated());
        assert!(client.is_initialized());
        assert_eq!(server.disconnects(), 0);
    }

    #[tokio::test]
    async fn terminate_releases_and_next_use_rebuilds() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        client.session().await.unwrap();

        assert!(client.terminate().await);
        assert!(!client.is_initialized());
        assert_eq!(server.sessions_released(), 1);

        client.session().await.unwrap();
        assert_eq!(server.sessions_opened(), 2);
        assert_eq!(server.local_gateways_started(), 1);
    }

    #[tokio::test]
    async fn gateway_failure_is_connection_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_connections(true);
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));

        assert!(matches!(
            Session::create_local(&client).await,
            Err(Error::Connection { .. })
        ));
        assert!(!client.is_initialized());
    }
}
