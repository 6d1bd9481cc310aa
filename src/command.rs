//! Remote command model: commands, options, responses and work items.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single command-line style option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdOption {
    /// Option name without leading dashes.
    pub name: String,
    /// Option value; `None` for boolean flags.
    pub value: Option<String>,
}

impl CmdOption {
    /// Creates a boolean flag option.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Creates a valued option.
    pub fn valued(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Renders the option as `--name` or `--name=value`.
    pub fn to_arg(&self) -> String {
        match &self.value {
            Some(value) => format!("--{}={}", self.name, value),
            None => format!("--{}", self.name),
        }
    }
}

/// A remote command: namespace, name, ordered options and selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command namespace (e.g. `si`, `api`).
    pub namespace: String,
    /// Command name within the namespace.
    pub name: String,
    /// Ordered options.
    pub options: Vec<CmdOption>,
    /// Selection arguments (paths, ids).
    pub selection: Vec<String>,
}

impl Command {
    /// Creates a command with no options.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            options: Vec::new(),
            selection: Vec::new(),
        }
    }

    /// Adds a boolean flag.
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.options.push(CmdOption::flag(name));
        self
    }

    /// Adds a valued option.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push(CmdOption::valued(name, value));
        self
    }

    /// Appends pre-built options in order.
    pub fn options(mut self, options: impl IntoIterator<Item = CmdOption>) -> Self {
        self.options.extend(options);
        self
    }

    /// Adds a selection argument.
    pub fn select(mut self, selection: impl Into<String>) -> Self {
        self.selection.push(selection.into());
        self
    }

    /// Returns true if an option with this name is present.
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o.name == name)
    }

    /// Returns the values of every option with this name, in order.
    pub fn option_values(&self, name: &str) -> Vec<&str> {
        self.options
            .iter()
            .filter(|o| o.name == name)
            .filter_map(|o| o.value.as_deref())
            .collect()
    }

    /// Returns `namespace name`, used to route scripted responses.
    pub fn qualified_name(&self) -> String {
        format!("{} {}", self.namespace, self.name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.namespace, self.name)?;
        for option in &self.options {
            write!(f, " {}", option.to_arg())?;
        }
        for selection in &self.selection {
            write!(f, " {}", selection)?;
        }
        Ok(())
    }
}

/// A typed field value on a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Items(Vec<WorkItem>),
}

impl FieldValue {
    /// Returns the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One unit of result data returned by a remote command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkItem {
    /// Item identifier (usually a member path).
    pub id: String,
    /// Item context (usually the owning sandbox or project).
    #[serde(default)]
    pub context: String,
    /// Item model type.
    #[serde(default)]
    pub model_type: String,
    /// Result message attached to the item, if any.
    #[serde(default)]
    pub result: Option<String>,
    /// Named fields.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl WorkItem {
    /// Creates an item with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets the context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Sets the result message.
    pub fn with_result(mut self, message: impl Into<String>) -> Self {
        self.result = Some(message.into());
        self
    }

    /// Adds a text field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .insert(name.into(), FieldValue::Text(value.into()));
        self
    }

    /// Returns a text field by name.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }
}

/// The outcome of a remote command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    /// Remote exit code.
    pub exit_code: i32,
    /// Returned work items, in server order.
    pub items: Vec<WorkItem>,
    /// Diagnostic text reported alongside a failure.
    #[serde(default)]
    pub message: String,
}

impl Response {
    /// Creates a successful response carrying `items`.
    pub fn ok(items: Vec<WorkItem>) -> Self {
        Self {
            exit_code: 0,
            items,
            message: String::new(),
        }
    }

    /// Creates a failed response with the given exit code and diagnostic.
    pub fn failed(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            items: Vec::new(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Default execution context bound onto every command runner.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ExecContext {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub secret: String,
    /// User to impersonate for this run.
    pub impersonate: Option<String>,
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("secret", &"[REDACTED]")
            .field("impersonate", &self.impersonate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_renders_options_and_selection() {
        let cmd = Command::new("si", "dropsandbox")
            .option("delete", "all")
            .flag("noconfirm")
            .select("/work/project.pj");

        assert_eq!(
            cmd.to_string(),
            "si dropsandbox --delete=all --noconfirm /work/project.pj"
        );
        assert!(cmd.has_option("noconfirm"));
        assert_eq!(cmd.qualified_name(), "si dropsandbox");
    }

    #[test]
    fn option_values_preserve_order() {
        let cmd = Command::new("si", "resync")
            .option("filter", "!file:a")
            .flag("recurse")
            .option("filter", "!file:b");

        assert_eq!(cmd.option_values("filter"), vec!["!file:a", "!file:b"]);
    }

    #[test]
    fn work_item_parses_from_json_line() {
        let line = r#"{"id":"src/main.c","context":"/work/project.pj","result":"Resynced","fields":{"type":"member","revision":3}}"#;
        let item: WorkItem = serde_json::from_str(line).unwrap();

        assert_eq!(item.id, "src/main.c");
        assert_eq!(item.text("type"), Some("member"));
        assert_eq!(item.fields.get("revision"), Some(&FieldValue::Int(3)));
        assert_eq!(item.result.as_deref(), Some("Resynced"));
    }

    #[test]
    fn exec_context_debug_redacts_secret() {
        let ctx = ExecContext {
            host: "vcs".to_string(),
            port: 7001,
            user: "builder".to_string(),
            secret: "hunter2".to_string(),
            impersonate: None,
        };

        assert!(!format!("{:?}", ctx).contains("hunter2"));
    }
}
