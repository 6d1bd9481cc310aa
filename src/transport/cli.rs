//! Transport that drives the server's command-line client.
//!
//! Every command runs as one client process. Connection routing and the
//! execution context become command-line options, and the client is
//! asked for JSON output: one work item per stdout line.
//!
//! Client output is drained by a background task from the moment the
//! process starts, so a long interim run never stalls on a full pipe.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as Process};
use tokio::task::JoinHandle;

use crate::command::{Command, ExecContext, Response, WorkItem};
use crate::config::CliConfig;
use crate::error::{Error, Result};
use crate::identity::Endpoint;

use super::{ApiVersion, CommandRunner, Connection, Transport, TransportSession};

/// Where a connection's commands are routed.
#[derive(Debug, Clone, Default)]
struct Route {
    /// `None` for the local client.
    server: Option<Endpoint>,
    gateway: Option<Endpoint>,
    version: Option<ApiVersion>,
    secure: bool,
}

impl Route {
    fn describe(&self) -> String {
        match (&self.server, &self.gateway) {
            (Some(server), Some(gateway)) => format!("{} via {}", server, gateway),
            (Some(server), None) => server.to_string(),
            (None, _) => "local client".to_string(),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(gateway) = &self.gateway {
            args.push(format!("--gateway={}", gateway));
        }
        if let Some(version) = &self.version {
            args.push(format!("--apiversion={}", version));
        }
        if self.secure {
            args.push("--secure".to_string());
        }
        args
    }
}

/// How to launch the client program.
#[derive(Debug, Clone)]
struct Client {
    program: String,
    env: HashMap<String, String>,
    /// Environment variable carrying the password instead of `--password`.
    password_env: Option<String>,
}

/// Transport backed by the server's command-line client.
///
/// Unless [`CliConfig::password_env`] is set, passwords are passed as
/// `--password` and are visible in the process list.
#[derive(Debug, Clone)]
pub struct CliTransport {
    client: Client,
}

impl CliTransport {
    /// Creates a transport using the configured client program.
    pub fn new(config: &CliConfig) -> Self {
        Self {
            client: Client {
                program: config.program.clone(),
                env: config.env.clone(),
                password_env: config.password_env.clone(),
            },
        }
    }

    fn connection(&self, route: Route) -> Box<dyn Connection> {
        Box::new(CliConnection {
            client: self.client.clone(),
            route,
        })
    }
}

#[async_trait]
impl Transport for CliTransport {
    async fn connect(&self, server: &Endpoint, secure: bool) -> Result<Box<dyn Connection>> {
        Ok(self.connection(Route {
            server: Some(server.clone()),
            secure,
            ..Default::default()
        }))
    }

    async fn connect_via_gateway(
        &self,
        gateway: &Endpoint,
        server: &Endpoint,
        secure: bool,
        version: ApiVersion,
    ) -> Result<Box<dyn Connection>> {
        Ok(self.connection(Route {
            server: Some(server.clone()),
            gateway: Some(gateway.clone()),
            version: Some(version),
            secure,
        }))
    }

    async fn start_local_gateway(&self) -> Result<Box<dyn Connection>> {
        tracing::info!(program = %self.client.program, "using local client gateway");
        Ok(self.connection(Route::default()))
    }
}

struct CliConnection {
    client: Client,
    route: Route,
}

#[async_trait]
impl Connection for CliConnection {
    fn endpoint(&self) -> String {
        self.route.describe()
    }

    async fn open_session(
        &self,
        name: &str,
        user: &str,
        secret: &str,
    ) -> Result<Arc<dyn TransportSession>> {
        let session = Arc::new(CliSession {
            client: self.client.clone(),
            route: self.route.clone(),
            name: name.to_string(),
            timeout_ms: AtomicU64::new(Duration::from_secs(300).as_millis() as u64),
            auto_reconnect: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        // The local client authenticates with its own defaults.
        if let Some(server) = &self.route.server {
            let mut runner = session.create_runner()?;
            runner.set_context(&ExecContext {
                host: server.host.clone(),
                port: server.port,
                user: user.to_string(),
                secret: secret.to_string(),
                impersonate: None,
            });
            let outcome = runner.execute(&Command::new("si", "connect")).await;
            runner.release().await?;
            let response = outcome?;
            if !response.is_success() {
                return Err(Error::Transport(format!(
                    "si connect exited with {}: {}",
                    response.exit_code, response.message
                )));
            }
        }

        tracing::debug!(endpoint = %self.endpoint(), session = %name, "opened client session");
        Ok(session)
    }

    async fn release(&self) -> Result<()> {
        tracing::debug!(endpoint = %self.endpoint(), "released client connection");
        Ok(())
    }
}

struct CliSession {
    client: Client,
    route: Route,
    name: String,
    timeout_ms: AtomicU64,
    auto_reconnect: AtomicBool,
    released: AtomicBool,
}

#[async_trait]
impl TransportSession for CliSession {
    fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn create_runner(&self) -> Result<Box<dyn CommandRunner>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "session '{}' has been released",
                self.name
            )));
        }
        // Every command is a fresh client process, so reconnecting is implicit.
        tracing::trace!(
            session = %self.name,
            auto_reconnect = self.auto_reconnect.load(Ordering::SeqCst),
            "creating client runner"
        );
        Ok(Box::new(CliRunner {
            client: self.client.clone(),
            route: self.route.clone(),
            timeout: Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst)),
            context: ExecContext::default(),
            running: None,
            released: false,
        }))
    }

    async fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Captured stdout and stderr of a client process.
type Captured = io::Result<(Vec<u8>, Vec<u8>)>;

/// A started client process and the task draining its output.
struct Running {
    child: Child,
    output: JoinHandle<Captured>,
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn drain(child: &mut Child) -> JoinHandle<Captured> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let (out, err) = tokio::join!(read_all(stdout), read_all(stderr));
        Ok((out?, err?))
    })
}

struct CliRunner {
    client: Client,
    route: Route,
    timeout: Duration,
    context: ExecContext,
    running: Option<Running>,
    released: bool,
}

impl CliRunner {
    /// Builds the client arguments for a command.
    fn build_args(&self, command: &Command) -> Vec<String> {
        let mut args = vec![command.namespace.clone(), command.name.clone()];

        if !self.context.host.is_empty() {
            args.push(format!("--hostname={}", self.context.host));
            args.push(format!("--port={}", self.context.port));
        }
        if !self.context.user.is_empty() {
            args.push(format!("--user={}", self.context.user));
            if self.client.password_env.is_none() {
                args.push(format!("--password={}", self.context.secret));
            }
        }
        if let Some(user) = &self.context.impersonate {
            args.push(format!("--impersonateUser={}", user));
        }
        args.extend(self.route.args());
        args.extend(command.options.iter().map(|o| o.to_arg()));
        args.push("--json".to_string());
        args.extend(command.selection.iter().cloned());

        args
    }

    fn spawn(&self, command: &Command) -> Result<Running> {
        if self.released {
            return Err(Error::Transport("runner has been released".to_string()));
        }

        tracing::debug!(program = %self.client.program, command = %command, "spawning client command");

        let mut process = Process::new(&self.client.program);
        process
            .args(self.build_args(command))
            .envs(&self.client.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(name) = &self.client.password_env {
            process.env(name, &self.context.secret);
        }

        let mut child = process.spawn().map_err(|e| {
            Error::Transport(format!("failed to spawn {}: {}", self.client.program, e))
        })?;
        let output = drain(&mut child);

        Ok(Running { child, output })
    }

    async fn collect(&self, mut running: Running) -> Result<Response> {
        let finished = async {
            let status = running.child.wait().await?;
            let (stdout, stderr) = (&mut running.output).await.map_err(io::Error::other)??;
            Ok::<_, io::Error>((status, stdout, stderr))
        };

        match tokio::time::timeout(self.timeout, finished).await {
            Ok(Ok((status, stdout, stderr))) => Ok(parse_output(status, &stdout, &stderr)),
            Ok(Err(e)) => Err(Error::Transport(format!("failed to wait for client: {}", e))),
            Err(_) => {
                running.output.abort();
                Err(Error::Transport(format!(
                    "command timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

/// Converts client output into a response, skipping lines that are not items.
fn parse_output(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Response {
    let stdout = String::from_utf8_lossy(stdout);
    let mut items = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<WorkItem>(line) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(line = %line, error = %e, "skipping unparsable client output"),
        }
    }

    Response {
        exit_code: status.code().unwrap_or(-1),
        items,
        message: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    fn set_context(&mut self, context: &ExecContext) {
        self.context = context.clone();
    }

    async fn execute(&mut self, command: &Command) -> Result<Response> {
        let running = self.spawn(command)?;
        self.collect(running).await
    }

    async fn start(&mut self, command: &Command) -> Result<()> {
        self.running = Some(self.spawn(command)?);
        Ok(())
    }

    async fn wait(&mut self) -> Result<Response> {
        let running = self
            .running
            .take()
            .ok_or_else(|| Error::Transport("no command has been started".to_string()))?;
        self.collect(running).await
    }

    fn is_finished(&mut self) -> bool {
        match self.running.as_mut() {
            Some(running) => !matches!(running.child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        if let Some(mut running) = self.running.take() {
            running.output.abort();
            running
                .child
                .kill()
                .await
                .map_err(|e| Error::Transport(format!("failed to interrupt client: {}", e)))?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        if self.running.is_some() && !self.is_finished() {
            self.interrupt().await?;
        }
        self.running = None;
        self.released = true;
        Ok(())
    }
}
