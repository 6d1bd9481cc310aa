//! Change reports produced by a resync.
//!
//! A report is an ordered, deduplicated list of [`ChangeRecord`]s, written
//! one record per line:
//!
//! ```text
//! msg:<message>,file:<identifier>,context:<context>
//! ```
//!
//! The reader is lenient. Fields may come in any order, and a segment with
//! an unknown key replaces the message with an "invalid field" diagnostic
//! instead of failing the whole report.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;

use crate::command::WorkItem;
use crate::error::Result;

/// Line ending used when writing change logs on this platform.
#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

/// One changed member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChangeRecord {
    pub message: String,
    pub file: String,
    pub context: String,
}

impl ChangeRecord {
    /// Creates a record; a trailing comma on the message is stripped.
    pub fn new(
        message: impl Into<String>,
        file: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        let mut message = message.into();
        if message.ends_with(',') {
            message.pop();
        }
        Self {
            message,
            file: file.into(),
            context: context.into(),
        }
    }

    /// Builds a record from a resync work item.
    pub fn from_item(item: &WorkItem) -> Self {
        Self::new(
            item.result.clone().unwrap_or_default(),
            item.id.clone(),
            item.context.clone(),
        )
    }

    /// Parses one line leniently. Never fails.
    pub fn parse_line(line: &str) -> Self {
        let mut record = ChangeRecord::default();

        for segment in line.trim_end_matches(['\r', '\n']).split(',') {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once(':') {
                Some(("msg", value)) => record.message = value.to_string(),
                Some(("file", value)) => record.file = value.to_string(),
                Some(("context", value)) => record.context = value.to_string(),
                _ => record.message = format!("invalid field in change record: {}", segment),
            }
        }

        record
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg:{},file:{},context:{}",
            self.message, self.file, self.context
        )
    }
}

/// Ordered set of change records; the first occurrence of a duplicate wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    records: IndexSet<ChangeRecord>,
}

impl ChangeReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a report from work items, in item order.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        items.into_iter().map(ChangeRecord::from_item).collect()
    }

    /// Parses a report written by [`ChangeReport::write_to`]. Blank lines are skipped.
    pub fn parse(text: &str) -> Self {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(ChangeRecord::parse_line)
            .collect()
    }

    /// Adds a record; returns false if an identical one is already present.
    pub fn push(&mut self, record: ChangeRecord) -> bool {
        self.records.insert(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter()
    }

    /// Writes every record followed by `line_ending`.
    pub fn write_to<W: std::io::Write>(&self, mut writer: W, line_ending: &str) -> Result<()> {
        for record in &self.records {
            write!(writer, "{}{}", record, line_ending)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl FromIterator<ChangeRecord> for ChangeReport {
    fn from_iter<I: IntoIterator<Item = ChangeRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeReport {
    type Item = &'a ChangeRecord;
    type IntoIter = indexmap::set::Iter<'a, ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// File sink for change reports.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    path: PathBuf,
}

impl ChangeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `report`, replacing any previous log, with the platform line ending.
    pub fn write(&self, report: &ChangeReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(&self.path)?;
        report.write_to(std::io::BufWriter::new(file), LINE_ENDING)?;

        tracing::debug!(path = %self.path.display(), records = report.len(), "wrote change log");
        Ok(())
    }

    /// Reads a previously written log back through the lenient parser.
    pub fn read(&self) -> Result<ChangeReport> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(ChangeReport::parse(&text))
    }
}
