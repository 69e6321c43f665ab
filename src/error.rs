use std::fmt;

/// Error raised by the planner core.
///
/// Expansion, scheduling, graph and fingerprint failures all surface as
/// this one structured type so that callers can report the offending
/// action and the plan entries that requested it without matching on a
/// closed set of kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub struct PlanError {
    /// Human readable description of the failure.
    pub message: String,
    /// Name of the function or module having raised the error.
    pub origin: Option<String>,
    /// Uid of the action that caused the error, if any.
    pub uid: Option<String>,
    /// Root-connected action uids in whose closure the failure lies.
    pub initiators: Vec<String>,
}

pub type Result<T> = std::result::Result<T, PlanError>;

impl PlanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            origin: None,
            uid: None,
            initiators: Vec::new(),
        }
    }

    pub fn with_origin(message: impl Into<String>, origin: &str) -> Self {
        Self {
            message: message.into(),
            origin: Some(origin.to_string()),
            uid: None,
            initiators: Vec::new(),
        }
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn initiators(mut self, initiators: Vec<String>) -> Self {
        self.initiators = initiators;
        self
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{}: {}", origin, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
