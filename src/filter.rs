//! Member filter and scope option encoding.
//!
//! Include patterns are OR-combined into a single `filter` option. Exclude
//! patterns become one negated `filter` option each, which the server ANDs.

use crate::command::CmdOption;

/// Separator between clauses of a scope expression.
pub const SCOPE_AND: &str = "&&";

/// Builds `filter` options from include/exclude pattern lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberFilterBuilder {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl MemberFilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a comma or semicolon separated list of include patterns.
    pub fn include(mut self, list: &str) -> Self {
        self.includes.extend(split_patterns(list));
        self
    }

    /// Adds a comma or semicolon separated list of exclude patterns.
    pub fn exclude(mut self, list: &str) -> Self {
        self.excludes.extend(split_patterns(list));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Renders the options, includes first.
    pub fn build(&self) -> Vec<CmdOption> {
        let mut options = Vec::with_capacity(self.excludes.len() + 1);

        if !self.includes.is_empty() {
            let clauses: Vec<String> = self
                .includes
                .iter()
                .map(|p| format!("file:{}", p))
                .collect();
            options.push(CmdOption::valued("filter", clauses.join(",")));
        }

        options.extend(
            self.excludes
                .iter()
                .map(|p| CmdOption::valued("filter", format!("!file:{}", p))),
        );

        options
    }
}

fn split_patterns(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
}

/// Splits a scope expression on `&&` into one `scope` option per clause.
///
/// A blank expression yields no options.
pub fn scope_options(scope: &str) -> Vec<CmdOption> {
    scope
        .split(SCOPE_AND)
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .map(|clause| CmdOption::valued("scope", clause))
        .collect()
}
