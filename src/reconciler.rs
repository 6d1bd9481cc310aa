//! Sandbox reconciliation.
//!
//! [`SandboxReconciler::verify_create_sandbox`] converges a local directory
//! onto a sandbox bound to the target project. The steps always run in the
//! same order: probe, classify, drop if stale, then create or reconfigure.
//! [`SandboxReconciler::resync`] then populates the sandbox and reports what
//! changed.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::{Command, Response, WorkItem};
use crate::error::{Error, Result};
use crate::filter::{scope_options, MemberFilterBuilder};
use crate::report::{ChangeLog, ChangeReport};
use crate::session::Session;

/// Item types that describe nested sandboxes rather than members.
pub const CONTAINER_TYPES: &[&str] = &[
    "subsandbox",
    "shared-subsandbox",
    "variant-subsandbox",
    "build-subsandbox",
    "shared-variant-subsandbox",
    "shared-build-subsandbox",
];

/// Reconciliation states of a local sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    /// No sandbox at the local path.
    Absent,
    /// Existing sandbox is bound to the target and can be reused.
    Compatible,
    /// Existing sandbox is bound to something else and must be dropped.
    Stale,
    /// A new sandbox was created.
    Recreated,
    /// The existing sandbox was reconfigured.
    Configured,
    /// Contents were resynced.
    Synced,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Absent => "absent",
            SandboxState::Compatible => "compatible",
            SandboxState::Stale => "stale",
            SandboxState::Recreated => "recreated",
            SandboxState::Configured => "configured",
            SandboxState::Synced => "synced",
        };
        write!(f, "{}", s)
    }
}

/// What a sandbox tracks within its project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    Trunk,
    /// A named development path.
    Variant(String),
    /// A pinned build revision.
    Build(String),
}

/// The sandbox a build wants at a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDescriptor {
    pub local_path: PathBuf,
    /// Remote project name, e.g. `/proj/project.pj`.
    pub project: String,
    pub kind: ProjectKind,
}

impl SandboxDescriptor {
    /// A trunk sandbox of `project` at `local_path`.
    pub fn trunk(local_path: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            project: project.into(),
            kind: ProjectKind::Trunk,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.kind = ProjectKind::Variant(variant.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.kind = ProjectKind::Build(revision.into());
        self
    }
}

/// What the server reports about an existing sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxInfo {
    pub project: String,
    pub development_path: Option<String>,
    pub build_revision: Option<String>,
}

impl SandboxInfo {
    /// Reads the first item of a sandbox-info response.
    pub fn from_response(response: &Response) -> Option<Self> {
        response.items.first().map(Self::from_item)
    }

    fn from_item(item: &WorkItem) -> Self {
        let field = |name: &str| {
            item.text(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Self {
            project: field("projectName").unwrap_or_default(),
            development_path: field("developmentPath"),
            build_revision: field("buildRevision"),
        }
    }
}

/// Decides whether an existing sandbox can serve `target`.
///
/// A different project is always stale. Otherwise a variant target needs
/// the same development path, a build target the same revision, and a
/// trunk target is compatible as is.
pub fn classify(existing: Option<&SandboxInfo>, target: &SandboxDescriptor) -> SandboxState {
    let Some(info) = existing else {
        return SandboxState::Absent;
    };

    if info.project != target.project {
        return SandboxState::Stale;
    }

    let compatible = match &target.kind {
        ProjectKind::Variant(name) => info.development_path.as_deref() == Some(name.as_str()),
        ProjectKind::Build(revision) => info.build_revision.as_deref() == Some(revision.as_str()),
        ProjectKind::Trunk => true,
    };

    if compatible {
        SandboxState::Compatible
    } else {
        SandboxState::Stale
    }
}

/// Line terminator written into sandbox working files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    #[default]
    Native,
    Lf,
    Crlf,
}

impl LineTerminator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineTerminator::Native => "native",
            LineTerminator::Lf => "lf",
            LineTerminator::Crlf => "crlf",
        }
    }
}

/// Options applied when a sandbox is created or reconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    #[serde(default)]
    pub line_terminator: LineTerminator,
    /// Scope expression; clauses joined with `&&`.
    #[serde(default)]
    pub scope: Option<String>,
}

impl ReconcileOptions {
    fn apply(&self, command: Command) -> Command {
        command
            .option("lineTerminator", self.line_terminator.as_str())
            .options(self.scope.as_deref().map(scope_options).unwrap_or_default())
    }
}

/// Flags and filters for a resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncOptions {
    /// Overwrite unchanged files too, not just the ones the server marks changed.
    pub clean_copy: bool,
    pub delete_non_members: bool,
    pub restore_timestamp: bool,
    /// Comma or semicolon separated include patterns.
    pub include: String,
    /// Comma or semicolon separated exclude patterns.
    pub exclude: String,
    /// A non-empty scope implies pruning out-of-scope members.
    pub scope: Option<String>,
}

impl ResyncOptions {
    fn has_scope(&self) -> bool {
        self.scope.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    fn command(&self, local_path: &Path) -> Command {
        let filters = MemberFilterBuilder::new()
            .include(&self.include)
            .exclude(&self.exclude);

        let mut command = Command::new("si", "resync")
            .flag("recurse")
            .option("forceConfirm", "yes")
            .options(filters.build());

        command = if self.clean_copy {
            command.flag("overwriteUnchanged")
        } else {
            command.option("filter", "changed:all")
        };
        if self.delete_non_members || self.has_scope() {
            command = command.flag("removeOutOfScope");
        }
        if self.restore_timestamp {
            command = command.flag("restoreTimestamp");
        }

        command.option("sandbox", path_arg(local_path))
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Drives sandboxes through their reconciliation states.
///
/// The reconciler never owns a session; each call borrows one.
#[derive(Debug, Clone, Default)]
pub struct SandboxReconciler {
    options: ReconcileOptions,
}

impl SandboxReconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Makes sure a sandbox bound to `target` exists at its local path.
    ///
    /// Returns [`SandboxState::Recreated`] when a new sandbox was created and
    /// [`SandboxState::Configured`] when a compatible one was reused.
    pub async fn verify_create_sandbox(
        &self,
        session: &Session,
        target: &SandboxDescriptor,
    ) -> Result<SandboxState> {
        let existing = self.probe(session, &target.local_path).await?;
        let state = classify(existing.as_ref(), target);

        tracing::info!(
            path = %target.local_path.display(),
            project = %target.project,
            state = %state,
            "classified sandbox"
        );

        match state {
            SandboxState::Compatible => {
                self.configure(session, &target.local_path).await?;
                Ok(SandboxState::Configured)
            }
            SandboxState::Stale => {
                self.drop_sandbox(session, &target.local_path).await?;
                self.create(session, target).await?;
                Ok(SandboxState::Recreated)
            }
            _ => {
                self.create(session, target).await?;
                Ok(SandboxState::Recreated)
            }
        }
    }

    /// Queries the sandbox at `local_path`.
    ///
    /// A failure the server reported with an exit code means there is no
    /// sandbox there. Failures that never reached the server propagate.
    pub async fn probe(&self, session: &Session, local_path: &Path) -> Result<Option<SandboxInfo>> {
        let command = Command::new("si", "sandboxinfo").option("sandbox", path_arg(local_path));

        match session.run(&command).await {
            Ok(response) => Ok(SandboxInfo::from_response(&response)),
            Err(e) if e.exit_code().is_some() => {
                tracing::debug!(path = %local_path.display(), error = %e, "no sandbox found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_sandbox(&self, session: &Session, local_path: &Path) -> Result<()> {
        let command = Command::new("si", "dropsandbox")
            .option("delete", "all")
            .option("forceConfirm", "yes")
            .flag("noconfirm")
            .select(path_arg(local_path));

        session
            .run(&command)
            .await
            .map_err(|e| sandbox_error(local_path, "drop", e))?;

        tracing::info!(path = %local_path.display(), "dropped stale sandbox");
        Ok(())
    }

    async fn create(&self, session: &Session, target: &SandboxDescriptor) -> Result<()> {
        let mut command = Command::new("si", "createsandbox").option("project", target.project.clone());
        command = match &target.kind {
            ProjectKind::Variant(name) => command.option("devpath", name.clone()),
            ProjectKind::Build(revision) => command.option("projectRevision", revision.clone()),
            ProjectKind::Trunk => command,
        };
        let command = self
            .options
            .apply(command.flag("nopopulate"))
            .select(path_arg(&target.local_path));

        session
            .run(&command)
            .await
            .map_err(|e| sandbox_error(&target.local_path, "create", e))?;

        tracing::info!(
            path = %target.local_path.display(),
            project = %target.project,
            kind = ?target.kind,
            "created sandbox"
        );
        Ok(())
    }

    async fn configure(&self, session: &Session, local_path: &Path) -> Result<()> {
        let command = self
            .options
            .apply(Command::new("si", "configuresandbox").option("sandbox", path_arg(local_path)));

        session
            .run(&command)
            .await
            .map_err(|e| sandbox_error(local_path, "configure", e))?;

        tracing::info!(path = %local_path.display(), "reconfigured sandbox");
        Ok(())
    }

    /// Resyncs the sandbox and returns the deduplicated change report.
    ///
    /// The report is written to `log` when one is given. Failures are
    /// returned as is; nothing is retried.
    pub async fn resync(
        &self,
        session: &Session,
        local_path: &Path,
        options: &ResyncOptions,
        log: Option<&ChangeLog>,
    ) -> Result<ChangeReport> {
        let command = options.command(local_path);
        let response = session.run(&command).await?;
        let report = ChangeReport::from_items(&response.items);

        if let Some(log) = log {
            log.write(&report)?;
        }

        tracing::info!(
            path = %local_path.display(),
            changes = report.len(),
            clean_copy = options.clean_copy,
            "resynced sandbox"
        );
        Ok(report)
    }

    /// Runs verification then resync, ending in [`SandboxState::Synced`].
    pub async fn reconcile(
        &self,
        session: &Session,
        target: &SandboxDescriptor,
        options: &ResyncOptions,
        log: Option<&ChangeLog>,
    ) -> Result<(SandboxState, ChangeReport)> {
        self.verify_create_sandbox(session, target).await?;
        let report = self.resync(session, &target.local_path, options, log).await?;
        Ok((SandboxState::Synced, report))
    }

    /// True if the sandbox has member-level changes.
    ///
    /// Nested sandbox entries do not count as changes.
    pub async fn view_changes(&self, session: &Session, local_path: &Path) -> Result<bool> {
        let command = Command::new("si", "viewsandbox")
            .flag("recurse")
            .option("filter", "changed:all")
            .option("sandbox", path_arg(local_path));

        let response = session.run(&command).await?;
        Ok(response
            .items
            .iter()
            .any(|item| !is_container(item_type(item))))
    }
}

fn is_container(item_type: &str) -> bool {
    CONTAINER_TYPES.iter().any(|t| *t == item_type)
}

fn item_type(item: &WorkItem) -> &str {
    item.text("type").unwrap_or(&item.model_type)
}

fn sandbox_error(path: &Path, step: &str, err: Error) -> Error {
    Error::Sandbox {
        path: path.to_path_buf(),
        reason: format!("{} failed: {}", step, err),
    }
}

/// Shuts down the local client process behind `session`.
///
/// Returns the exit command's exit code, or 0 when there is nothing to
/// shut down: a local client that was never started or has been released
/// is left alone, as is one that does not answer a ping.
pub async fn terminate_local_client(session: &Session) -> i32 {
    if session.local_client().is_some_and(|client| !client.is_initialized()) {
        tracing::debug!("local client never started, nothing to terminate");
        return 0;
    }
    if let Err(e) = session.ping().await {
        tracing::debug!(error = %e, "local client not reachable, nothing to terminate");
        return 0;
    }

    let command = Command::new("si", "exit").flag("noabort");
    match session.run(&command).await {
        Ok(response) => response.exit_code,
        Err(e) => {
            tracing::warn!(error = %e, "failed to shut down local client");
            e.exit_code().unwrap_or(-1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::identity::{Endpoint, Identity};
    use crate::local::LocalClient;
    use crate::testing::ScriptedTransport;
    use std::sync::Arc;

    const PROJECT: &str = "/proj/app/project.pj";

    fn info(project: &str, devpath: Option<&str>, revision: Option<&str>) -> SandboxInfo {
        SandboxInfo {
            project: project.to_string(),
            development_path: devpath.map(String::from),
            build_revision: revision.map(String::from),
        }
    }

    fn sandbox_item(project: &str, devpath: &str) -> WorkItem {
        WorkItem::new("/work/app/project.pj")
            .with_field("projectName", project)
            .with_field("developmentPath", devpath)
    }

    async fn session(server: &Arc<ScriptedTransport>) -> Session {
        Session::create_remote(
            Identity::new(Endpoint::new("vcs", 7001), "builder", "pw"),
            server.clone(),
            SessionConfig::default(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn classification_table() {
        let trunk = SandboxDescriptor::trunk("/work/app", PROJECT);
        let variant = trunk.clone().with_variant("release-2");
        let build = trunk.clone().with_revision("1.42");

        assert_eq!(classify(None, &trunk), SandboxState::Absent);
        assert_eq!(
            classify(Some(&info(PROJECT, None, None)), &trunk),
            SandboxState::Compatible
        );
        assert_eq!(
            classify(Some(&info(PROJECT, Some("release-2"), None)), &variant),
            SandboxState::Compatible
        );
        assert_eq!(
            classify(Some(&info(PROJECT, Some("release-1"), None)), &variant),
            SandboxState::Stale
        );
        assert_eq!(
            classify(Some(&info("/proj/other.pj", None, None)), &trunk),
            SandboxState::Stale
        );
        assert_eq!(
            classify(Some(&info(PROJECT, None, Some("1.42"))), &build),
            SandboxState::Compatible
        );
        assert_eq!(
            classify(Some(&info(PROJECT, None, Some("1.41"))), &build),
            SandboxState::Stale
        );
        assert_eq!(
            classify(Some(&info(PROJECT, None, None)), &variant),
            SandboxState::Stale
        );
    }

    #[test]
    fn sandbox_info_reads_fields() {
        let response = Response::ok(vec![sandbox_item(PROJECT, "release-2")
            .with_field("buildRevision", " ")]);

        let info = SandboxInfo::from_response(&response).unwrap();

        assert_eq!(info.project, PROJECT);
        assert_eq!(info.development_path.as_deref(), Some("release-2"));
        assert_eq!(info.build_revision, None);
        assert!(SandboxInfo::from_response(&Response::ok(vec![])).is_none());
    }

    #[tokio::test]
    async fn missing_sandbox_is_created_without_drop() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::failed(128, "not a sandbox"));
        let session = session(&server).await;
        let reconciler = SandboxReconciler::new(ReconcileOptions {
            line_terminator: LineTerminator::Lf,
            scope: Some("name:*.c && type:text".to_string()),
        });

        let state = reconciler
            .verify_create_sandbox(&session, &SandboxDescriptor::trunk("/work/app", PROJECT))
            .await
            .unwrap();

        assert_eq!(state, SandboxState::Recreated);
        assert_eq!(server.command_names(), vec!["si sandboxinfo", "si createsandbox"]);

        let create = server.last("si createsandbox").unwrap();
        assert_eq!(create.option_values("project"), vec![PROJECT]);
        assert!(create.has_option("nopopulate"));
        assert!(!create.has_option("devpath"));
        assert_eq!(create.option_values("lineTerminator"), vec!["lf"]);
        assert_eq!(create.option_values("scope"), vec!["name:*.c", "type:text"]);
        assert_eq!(create.selection, vec!["/work/app"]);
    }

    #[tokio::test]
    async fn compatible_sandbox_is_reconfigured() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::ok(vec![sandbox_item(PROJECT, "release-2")]));
        let session = session(&server).await;
        let target = SandboxDescriptor::trunk("/work/app", PROJECT).with_variant("release-2");

        let state = SandboxReconciler::default()
            .verify_create_sandbox(&session, &target)
            .await
            .unwrap();

        assert_eq!(state, SandboxState::Configured);
        assert_eq!(server.command_names(), vec!["si sandboxinfo", "si configuresandbox"]);

        let configure = server.last("si configuresandbox").unwrap();
        assert_eq!(configure.option_values("sandbox"), vec!["/work/app"]);
        assert_eq!(configure.option_values("lineTerminator"), vec!["native"]);
        assert!(!configure.has_option("project"));
        assert!(!configure.has_option("devpath"));
    }

    #[tokio::test]
    async fn stale_variant_is_dropped_then_created() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::ok(vec![sandbox_item(PROJECT, "release-1")]));
        let session = session(&server).await;
        let target = SandboxDescriptor::trunk("/work/app", PROJECT).with_variant("release-2");

        let state = SandboxReconciler::default()
            .verify_create_sandbox(&session, &target)
            .await
            .unwrap();

        assert_eq!(state, SandboxState::Recreated);
        assert_eq!(
            server.command_names(),
            vec!["si sandboxinfo", "si dropsandbox", "si createsandbox"]
        );

        let drop = server.last("si dropsandbox").unwrap();
        assert_eq!(drop.option_values("delete"), vec!["all"]);
        assert_eq!(drop.option_values("forceConfirm"), vec!["yes"]);
        assert!(drop.has_option("noconfirm"));
        assert_eq!(
            server.last("si createsandbox").unwrap().option_values("devpath"),
            vec!["release-2"]
        );
    }

    #[tokio::test]
    async fn failed_drop_aborts_with_sandbox_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::ok(vec![sandbox_item("/proj/other.pj", "")]));
        server.respond("si dropsandbox", Response::failed(1, "sandbox is locked"));
        let session = session(&server).await;

        let err = SandboxReconciler::default()
            .verify_create_sandbox(&session, &SandboxDescriptor::trunk("/work/app", PROJECT))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Sandbox { ref path, .. } if path == Path::new("/work/app")));
        assert_eq!(server.count("si createsandbox"), 0);
    }

    #[tokio::test]
    async fn build_target_passes_revision() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si sandboxinfo", Response::failed(128, "not a sandbox"));
        let session = session(&server).await;
        let target = SandboxDescriptor::trunk("/work/app", PROJECT).with_revision("1.42");

        SandboxReconciler::default()
            .verify_create_sandbox(&session, &target)
            .await
            .unwrap();

        let create = server.last("si createsandbox").unwrap();
        assert_eq!(create.option_values("projectRevision"), vec!["1.42"]);
    }

    #[tokio::test]
    async fn unreachable_server_is_not_mistaken_for_missing_sandbox() {
        let server = Arc::new(ScriptedTransport::new());
        server.fail_command("si sandboxinfo");
        let session = session(&server).await;
        let target = SandboxDescriptor::trunk("/work/app", PROJECT);

        let err = SandboxReconciler::default()
            .verify_create_sandbox(&session, &target)
            .await
            .unwrap_err();

        assert!(err.is_command());
        assert_eq!(err.exit_code(), None);
        assert_eq!(server.count("si createsandbox"), 0);
        assert_eq!(server.count("si dropsandbox"), 0);
    }

    #[tokio::test]
    async fn resync_restricted_to_changed_files() {
        let server = Arc::new(ScriptedTransport::new());
        let session = session(&server).await;

        SandboxReconciler::default()
            .resync(&session, Path::new("/work/app"), &ResyncOptions::default(), None)
            .await
            .unwrap();

        let resync = server.last("si resync").unwrap();
        assert!(resync.has_option("recurse"));
        assert_eq!(resync.option_values("forceConfirm"), vec!["yes"]);
        assert_eq!(resync.option_values("filter"), vec!["changed:all"]);
        assert!(!resync.has_option("overwriteUnchanged"));
        assert!(!resync.has_option("removeOutOfScope"));
        assert!(!resync.has_option("restoreTimestamp"));
    }

    #[tokio::test]
    async fn clean_resync_with_filters_and_scope() {
        let server = Arc::new(ScriptedTransport::new());
        let session = session(&server).await;
        let options = ResyncOptions {
            clean_copy: true,
            restore_timestamp: true,
            include: "src/*.c".to_string(),
            exclude: "*.o".to_string(),
            scope: Some("name:*.c".to_string()),
            ..Default::default()
        };

        SandboxReconciler::default()
            .resync(&session, Path::new("/work/app"), &options, None)
            .await
            .unwrap();

        let resync = server.last("si resync").unwrap();
        assert!(resync.has_option("overwriteUnchanged"));
        assert_eq!(resync.option_values("filter"), vec!["file:src/*.c", "!file:*.o"]);
        assert!(resync.has_option("removeOutOfScope"));
        assert!(resync.has_option("restoreTimestamp"));
    }

    #[tokio::test]
    async fn delete_non_members_without_scope_removes_out_of_scope() {
        let server = Arc::new(ScriptedTransport::new());
        let session = session(&server).await;
        let options = ResyncOptions {
            delete_non_members: true,
            scope: None,
            ..Default::default()
        };

        SandboxReconciler::default()
            .resync(&session, Path::new("/work/app"), &options, None)
            .await
            .unwrap();

        let resync = server.last("si resync").unwrap();
        assert!(resync.has_option("removeOutOfScope"));
        assert!(!resync.has_option("scope"));
    }

    #[tokio::test]
    async fn failed_resync_is_command_error() {
        let server = Arc::new(ScriptedTransport::new());
        server.respond("si resync", Response::failed(3, "disk full"));
        let session = session(&server).await;

        let err = SandboxReconciler::default()
            .resync(&session, Path::new("/work/app"), &ResyncOptions::default(), None)
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(server.count("si resync"), 1);
    }

    #[tokio::test]
    async fn view_changes_ignores_nested_sandboxes() {
        let server = Arc::new(ScriptedTransport::new());
        let session = session(&server).await;
        let reconciler = SandboxReconciler::default();
        let path = Path::new("/work/app");

        assert!(!reconciler.view_changes(&session, path).await.unwrap());

        server.respond(
            "si viewsandbox",
            Response::ok(vec![
                WorkItem::new("lib/project.pj").with_field("type", "subsandbox"),
                WorkItem::new("ext/project.pj").with_field("type", "shared-variant-subsandbox"),
            ]),
        );
        assert!(!reconciler.view_changes(&session, path).await.unwrap());

        server.respond(
            "si viewsandbox",
            Response::ok(vec![
                WorkItem::new("lib/project.pj").with_field("type", "subsandbox"),
                WorkItem::new("lib/a.c").with_field("type", "member"),
            ]),
        );
        assert!(reconciler.view_changes(&session, path).await.unwrap());

        let view = server.last("si viewsandbox").unwrap();
        assert!(view.has_option("recurse"));
        assert_eq!(view.option_values("filter"), vec!["changed:all"]);
    }

    #[tokio::test]
    async fn terminate_local_client_issues_exit() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        let session = Session::create_local(&client).await.unwrap();

        assert_eq!(terminate_local_client(&session).await, 0);
        let exit = server.last("si exit").unwrap();
        assert!(exit.has_option("noabort"));

        server.respond("si exit", Response::failed(2, "busy"));
        assert_eq!(terminate_local_client(&session).await, 2);
    }

    #[tokio::test]
    async fn terminate_local_client_skips_unreachable_client() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        let session = Session::create_local(&client).await.unwrap();
        server.fail_command("api ping");

        assert_eq!(terminate_local_client(&session).await, 0);
        assert_eq!(server.count("si exit"), 0);
    }

    #[tokio::test]
    async fn terminate_local_client_leaves_unstarted_client_alone() {
        let server = Arc::new(ScriptedTransport::new());
        let client = Arc::new(LocalClient::new(server.clone(), SessionConfig::default()));
        let session = Session::create_local(&client).await.unwrap();
        assert!(client.terminate().await);

        assert_eq!(terminate_local_client(&session).await, 0);
        assert!(!client.is_initialized());
        assert_eq!(server.sessions_opened(), 1);
        assert_eq!(server.count("api ping"), 0);
        assert_eq!(server.count("si exit"), 0);
    }
}
