// Ruleset Evaluation
// Conditional execution and failure tolerance for containers

use crate::records::Status;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How rule values are compared against build data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Matcher {
    /// Shell-style globbing where `*` does not cross `/`
    #[default]
    Filepath,
    Regexp,
}

/// How the individual rules of a rule set combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    And,
    Or,
}

/// Values a container may be restricted to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub branch: Vec<String>,
    #[serde(default)]
    pub event: Vec<String>,
    #[serde(default)]
    pub repo: Vec<String>,
    #[serde(default)]
    pub status: Vec<String>,
}

/// Build data a ruleset is evaluated against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleData {
    pub branch: String,
    /// Event in `event` or `event:action` form
    pub event: String,
    pub repo: String,
    pub status: Status,
}

/// Per-container execution policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(rename = "if", default)]
    pub if_: Rules,
    #[serde(default)]
    pub unless: Rules,
    #[serde(default)]
    pub matcher: Matcher,
    #[serde(default)]
    pub operator: Operator,
    /// Keep the build status untouched when the container fails
    #[serde(rename = "continue", default)]
    pub continue_on_failure: bool,
}

impl Rules {
    pub fn is_empty(&self) -> bool {
        self.branch.is_empty() && self.event.is_empty() && self.repo.is_empty() && self.status.is_empty()
    }

    /// Evaluate every non-empty rule and combine the outcomes with the operator
    pub fn matches(&self, data: &RuleData, matcher: Matcher, operator: Operator) -> bool {
        let status = data.status.as_str();
        let checks = [
            (!self.branch.is_empty()).then(|| any_match(&self.branch, &data.branch, matcher)),
            (!self.event.is_empty()).then(|| self.event.iter().any(|e| event_matches(e, &data.event, matcher))),
            (!self.repo.is_empty()).then(|| any_match(&self.repo, &data.repo, matcher)),
            (!self.status.is_empty()).then(|| self.status.iter().any(|s| s.eq_ignore_ascii_case(status))),
        ];

        let mut outcomes = checks.iter().flatten().copied().peekable();
        if outcomes.peek().is_none() {
            return true;
        }

        match operator {
            Operator::And => outcomes.all(|m| m),
            Operator::Or => outcomes.any(|m| m),
        }
    }

    fn targets_status(&self, status: Status) -> bool {
        self.status.iter().any(|s| s.eq_ignore_ascii_case(status.as_str()))
    }
}

impl Ruleset {
    /// Whether the if/unless rules match the data
    pub fn matches(&self, data: &RuleData) -> bool {
        if self.if_.is_empty() && self.unless.is_empty() {
            return true;
        }

        if !self.unless.is_empty() && self.unless.matches(data, self.matcher, self.operator) {
            return false;
        }

        if self.if_.is_empty() {
            return true;
        }

        self.if_.matches(data, self.matcher, self.operator)
    }

    /// Whether a container with this ruleset runs under the given build data
    pub fn execute(&self, data: &RuleData) -> bool {
        match data.status {
            Status::Running | Status::Success => {
                let mut data = data.clone();
                data.status = Status::Success;
                self.matches(&data)
            }
            status => {
                // only containers that explicitly opt into this status run
                let opted_in = self.if_.targets_status(status)
                    || (!self.unless.status.is_empty() && !self.unless.targets_status(status));

                opted_in && self.matches(data)
            }
        }
    }
}

fn any_match(patterns: &[String], value: &str, matcher: Matcher) -> bool {
    patterns.iter().any(|p| pattern_matches(p, value, matcher))
}

/// `pull_request` matches every action of the event, `pull_request:opened` only that one
fn event_matches(pattern: &str, event: &str, matcher: Matcher) -> bool {
    if pattern_matches(pattern, event, matcher) {
        return true;
    }

    if !pattern.contains(':') {
        if let Some((name, _)) = event.split_once(':') {
            return pattern_matches(pattern, name, matcher);
        }
    }

    false
}

/// Compare a value against a glob or regular expression pattern
pub fn pattern_matches(pattern: &str, value: &str, matcher: Matcher) -> bool {
    let expr = match matcher {
        Matcher::Filepath => glob_to_regex(pattern),
        Matcher::Regexp => pattern.to_string(),
    };

    match Regex::new(&expr) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid ruleset pattern");
            false
        }
    }
}

/// Translate a filepath glob into an anchored regular expression
pub fn glob_to_regex(pattern: &str) -> String {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    expr
}
