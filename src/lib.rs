//! VCS Sandbox - pooled server sessions and sandbox reconciliation for build workers
//!
//! This library keeps authenticated, reusable sessions to a version-control server
//! and converges a local working directory onto a sandbox of a remote project,
//! reporting which members changed.

pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod local;
pub mod pool;
pub mod reconciler;
pub mod report;
pub mod session;
pub mod testing;
pub mod transport;

pub use command::{CmdOption, Command, ExecContext, FieldValue, Response, WorkItem};
pub use config::{
    CliConfig, PoolConfig, ServerConfig, SessionConfig, Settings, Validate, ValidationResult,
    CLI_ENV_VAR,
};
pub use error::{Error, Result};
pub use filter::{scope_options, MemberFilterBuilder};
pub use identity::{Endpoint, Identity};
pub use local::LocalClient;
pub use pool::{
    EvictionCandidate, EvictionPolicy, IdleEvictionPolicy, LivenessEvictionPolicy, PoolStats,
    SessionPool,
};
pub use reconciler::{
    classify, terminate_local_client, LineTerminator, ProjectKind, ReconcileOptions,
    ResyncOptions, SandboxDescriptor, SandboxInfo, SandboxReconciler, SandboxState,
};
pub use report::{ChangeLog, ChangeRecord, ChangeReport};
pub use session::Session;
pub use transport::{ApiVersion, CliTransport, CommandRunner, Connection, Transport, TransportSession};
