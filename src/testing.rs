//! In-memory scripted server for tests.
//!
//! [`ScriptedTransport`] implements the whole transport seam without any
//! network. Responses are scripted per command (`namespace name`), failures
//! can be injected per command or for connection setup, and every command
//! is journaled together with the context it ran under. Unscripted
//! commands succeed with no items.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{Command, ExecContext, Response};
use crate::error::{Error, Result};
use crate::identity::Endpoint;
use crate::transport::{ApiVersion, CommandRunner, Connection, Transport, TransportSession};

#[derive(Default)]
struct State {
    responses: HashMap<String, Response>,
    failing: HashSet<String>,
    fail_connections: bool,
    fail_session_open: bool,
    hold_interim: bool,
    connect_delay: Option<Duration>,

    direct_connections: usize,
    gateway_connections: usize,
    local_gateways: usize,
    sessions_opened: usize,
    sessions_released: usize,
    connections_released: usize,
    interrupts: usize,
    live_runners: usize,
    connects_in_flight: usize,
    peak_connects_in_flight: usize,

    last_timeout: Option<Duration>,
    auto_reconnect: bool,
    last_session_name: Option<String>,
    last_api_version: Option<ApiVersion>,
    journal: Vec<(Command, ExecContext)>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outcome(&self, command: &Command, context: &ExecContext) -> Result<Response> {
        let mut state = self.state();
        state.journal.push((command.clone(), context.clone()));

        let name = command.qualified_name();
        if state.failing.contains(&name) {
            return Err(Error::Transport(format!("scripted failure for '{}'", name)));
        }
        Ok(state.responses.get(&name).cloned().unwrap_or_default())
    }

    /// Simulates connection setup latency, tracking overlapping setups.
    async fn delay(&self) {
        let delay = {
            let mut state = self.state();
            state.connects_in_flight += 1;
            state.peak_connects_in_flight = state
                .peak_connects_in_flight
                .max(state.connects_in_flight);
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state().connects_in_flight -= 1;
    }
}

/// A scripted, in-memory version-control server.
#[derive(Clone)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Scripts the response for every later `namespace name` command.
    pub fn respond(&self, command: &str, response: Response) {
        self.shared
            .state()
            .responses
            .insert(command.to_string(), response);
    }

    /// Makes `namespace name` fail at the transport level.
    pub fn fail_command(&self, command: &str) {
        self.shared.state().failing.insert(command.to_string());
    }

    /// Removes every injected command failure.
    pub fn clear_failures(&self) {
        self.shared.state().failing.clear();
    }

    /// Makes connection setup (direct, gateway, local) fail.
    pub fn fail_connections(&self, fail: bool) {
        self.shared.state().fail_connections = fail;
    }

    /// Makes opening a session fail after the connection succeeds.
    pub fn fail_session_open(&self, fail: bool) {
        self.shared.state().fail_session_open = fail;
    }

    /// Keeps interim runs unfinished until interrupted.
    pub fn hold_interim(&self, hold: bool) {
        self.shared.state().hold_interim = hold;
    }

    /// Delays every connection setup, widening race windows.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.state().connect_delay = Some(delay);
    }

    /// Every command run so far with the context it ran under.
    pub fn journal(&self) -> Vec<(Command, ExecContext)> {
        self.shared.state().journal.clone()
    }

    /// Every command run so far.
    pub fn commands(&self) -> Vec<Command> {
        self.journal().into_iter().map(|(c, _)| c).collect()
    }

    /// Qualified names of every command run so far, in order.
    pub fn command_names(&self) -> Vec<String> {
        self.commands().iter().map(Command::qualified_name).collect()
    }

    /// Number of times `namespace name` ran.
    pub fn count(&self, command: &str) -> usize {
        self.command_names().iter().filter(|n| *n == command).count()
    }

    /// The last `namespace name` command run, if any.
    pub fn last(&self, command: &str) -> Option<Command> {
        self.commands()
            .into_iter()
            .rev()
            .find(|c| c.qualified_name() == command)
    }

    pub fn disconnects(&self) -> usize {
        self.count("si disconnect")
    }

    pub fn direct_connections(&self) -> usize {
        self.shared.state().direct_connections
    }

    pub fn gateway_connections(&self) -> usize {
        self.shared.state().gateway_connections
    }

    pub fn local_gateways_started(&self) -> usize {
        self.shared.state().local_gateways
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.state().sessions_opened
    }

    pub fn sessions_released(&self) -> usize {
        self.shared.state().sessions_released
    }

    pub fn connections_released(&self) -> usize {
        self.shared.state().connections_released
    }

    pub fn interrupts(&self) -> usize {
        self.shared.state().interrupts
    }

    /// Highest number of connection setups that overlapped in time.
    pub fn peak_concurrent_connects(&self) -> usize {
        self.shared.state().peak_connects_in_flight
    }

    /// Runners created and not yet released.
    pub fn live_runners(&self) -> usize {
        self.shared.state().live_runners
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.shared.state().last_timeout
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.shared.state().auto_reconnect
    }

    pub fn last_session_name(&self) -> Option<String> {
        self.shared.state().last_session_name.clone()
    }

    pub fn last_api_version(&self) -> Option<ApiVersion> {
        self.shared.state().last_api_version
    }

    fn connection(&self, endpoint: String) -> Box<dyn Connection> {
        Box::new(ScriptedConnection {
            shared: Arc::clone(&self.shared),
            endpoint,
        })
    }

    fn refuse(&self, endpoint: &str) -> Result<()> {
        if self.shared.state().fail_connections {
            return Err(Error::Transport(format!("{} refused the connection", endpoint)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, server: &Endpoint, _secure: bool) -> Result<Box<dyn Connection>> {
        self.shared.delay().await;
        self.refuse(&server.to_string())?;
        self.shared.state().direct_connections += 1;
        Ok(self.connection(server.to_string()))
    }

    async fn connect_via_gateway(
        &self,
        gateway: &Endpoint,
        server: &Endpoint,
        _secure: bool,
        version: ApiVersion,
    ) -> Result<Box<dyn Connection>> {
        self.shared.delay().await;
        self.refuse(&gateway.to_string())?;
        {
            let mut state = self.shared.state();
            state.gateway_connections += 1;
            state.last_api_version = Some(version);
        }
        Ok(self.connection(format!("{} via {}", server, gateway)))
    }

    async fn start_local_gateway(&self) -> Result<Box<dyn Connection>> {
        self.shared.delay().await;
        self.refuse("local client")?;
        self.shared.state().local_gateways += 1;
        Ok(self.connection("local client".to_string()))
    }
}

struct ScriptedConnection {
    shared: Arc<Shared>,
    endpoint: String,
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn open_session(
        &self,
        name: &str,
        _user: &str,
        _secret: &str,
    ) -> Result<Arc<dyn TransportSession>> {
        let mut state = self.shared.state();
        if state.fail_session_open {
            return Err(Error::Transport("authentication failed".to_string()));
        }
        state.sessions_opened += 1;
        state.last_session_name = Some(name.to_string());

        Ok(Arc::new(ScriptedSession {
            shared: Arc::clone(&self.shared),
            released: Mutex::new(false),
        }))
    }

    async fn release(&self) -> Result<()> {
        self.shared.state().connections_released += 1;
        Ok(())
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
    released: Mutex<bool>,
}

impl ScriptedSession {
    fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    fn set_timeout(&self, timeout: Duration) {
        self.shared.state().last_timeout = Some(timeout);
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.state().auto_reconnect = enabled;
    }

    fn create_runner(&self) -> Result<Box<dyn CommandRunner>> {
        if self.is_released() {
            return Err(Error::Transport("session has been released".to_string()));
        }
        self.shared.state().live_runners += 1;
        Ok(Box::new(ScriptedRunner {
            shared: Arc::clone(&self.shared),
            context: ExecContext::default(),
            pending: None,
            finished: true,
            released: false,
        }))
    }

    async fn release(&self) -> Result<()> {
        *self.released.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.shared.state().sessions_released += 1;
        Ok(())
    }
}

struct ScriptedRunner {
    shared: Arc<Shared>,
    context: ExecContext,
    pending: Option<Result<Response>>,
    finished: bool,
    released: bool,
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn set_context(&mut self, context: &ExecContext) {
        self.context = context.clone();
    }

    async fn execute(&mut self, command: &Command) -> Result<Response> {
        self.shared.outcome(command, &self.context)
    }

    async fn start(&mut self, command: &Command) -> Result<()> {
        let outcome = self.shared.outcome(command, &self.context);
        self.finished = !self.shared.state().hold_interim;
        self.pending = Some(outcome);
        Ok(())
    }

    async fn wait(&mut self) -> Result<Response> {
        self.finished = true;
        self.pending
            .take()
            .unwrap_or_else(|| Err(Error::Transport("no command has been started".to_string())))
    }

    fn is_finished(&mut self) -> bool {
        self.finished
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.shared.state().interrupts += 1;
        self.finished = true;
        self.pending = None;
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.shared.state().live_runners -= 1;
        }
        Ok(())
    }
}
