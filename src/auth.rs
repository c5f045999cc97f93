//! Access Control
//!
//! ACL authorizer consulted by the network service before serving a request.
//! Policies are read from a model file and a policy file:
//!
//! ```text
//! # model.conf
//! [request_definition]
//! r = sub, obj, act
//! [policy_definition]
//! p = sub, obj, act
//!
//! # policy.csv
//! p, root, *, produce
//! p, root, *, consume
//! p, nobody, *, consume
//! ```
//!
//! A `*` in any policy field matches every value.

use std::path::Path;

/// Wildcard accepted in policy fields.
pub const WILDCARD: &str = "*";

/// Authorization errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{subject} not permitted to {action} to {object}")]
    PermissionDenied {
        subject: String,
        object: String,
        action: String,
    },
    #[error("invalid acl model {path}: {reason}")]
    InvalidModel { path: String, reason: String },
    #[error("invalid acl policy {path} line {line}: {reason}")]
    InvalidPolicy {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    subject: String,
    object: String,
    action: String,
}

impl Rule {
    fn matches(&self, subject: &str, object: &str, action: &str) -> bool {
        field_matches(&self.subject, subject)
            && field_matches(&self.object, object)
            && field_matches(&self.action, action)
    }
}

fn field_matches(rule: &str, value: &str) -> bool {
    rule == WILDCARD || rule == value
}

/// ACL authorizer.
#[derive(Debug, Clone)]
pub struct Authorizer {
    /// `None` grants everything
    rules: Option<Vec<Rule>>,
}

impl Authorizer {
    /// Load the authorizer from a model file and a policy file.
    ///
    /// When both paths are empty every request is permitted.
    pub fn new(model_file: impl AsRef<Path>, policy_file: impl AsRef<Path>) -> Result<Self, AuthError> {
        let model_file = model_file.as_ref();
        let policy_file = policy_file.as_ref();

        if model_file.as_os_str().is_empty() && policy_file.as_os_str().is_empty() {
            tracing::warn!("no acl files configured, all requests will be permitted");
            return Ok(Self::permissive());
        }

        let model = read_file(model_file)?;
        check_model(&model, model_file)?;

        let policy = read_file(policy_file)?;
        let rules = parse_policy(&policy, policy_file)?;
        tracing::info!(rules = rules.len(), policy = %policy_file.display(), "acl loaded");

        Ok(Self { rules: Some(rules) })
    }

    /// An authorizer that permits every request.
    pub fn permissive() -> Self {
        Self { rules: None }
    }

    /// Check whether `subject` may perform `action` on `object`.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError> {
        let Some(rules) = &self.rules else {
            return Ok(());
        };

        if rules.iter().any(|r| r.matches(subject, object, action)) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

fn read_file(path: &Path) -> Result<String, AuthError> {
    std::fs::read_to_string(path).map_err(|source| AuthError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn check_model(model: &str, path: &Path) -> Result<(), AuthError> {
    for section in ["[request_definition]", "[policy_definition]"] {
        if !model.lines().any(|l| l.trim() == section) {
            return Err(AuthError::InvalidModel {
                path: path.display().to_string(),
                reason: format!("missing {} section", section),
            });
        }
    }
    Ok(())
}

fn parse_policy(policy: &str, path: &Path) -> Result<Vec<Rule>, AuthError> {
    let mut rules = Vec::new();

    for (idx, line) in policy.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let invalid = |reason: &str| AuthError::InvalidPolicy {
            path: path.display().to_string(),
            line: idx + 1,
            reason: reason.to_string(),
        };

        match fields.as_slice() {
            ["p", subject, object, action] => rules.push(Rule {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            }),
            ["p", ..] => return Err(invalid("expected `p, subject, object, action`")),
            _ => return Err(invalid("unsupported policy type")),
        }
    }

    Ok(rules)
}
