use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// Transitions are monotonic along
/// `new -> queued -> running -> (ok|error)` with an optional `staging_out`
/// between `new` and `queued` while input files travel to the execution
/// site, and `staging_in` between `running` (or `queued`) and the terminal
/// state while results travel back. Any non-terminal state may drop
/// straight to `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    StagingOut,
    Queued,
    Running,
    StagingIn,
    Ok,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Ok | JobState::Error)
    }

    /// Whether the state graph permits moving from `self` to `to`.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            // every non-terminal state may fail
            (_, Error) => true,
            (New, StagingOut) | (New, Queued) => true,
            (StagingOut, Queued) => true,
            (Queued, Running) => true,
            // terminal observation may arrive while still queued
            (Queued, StagingIn) => true,
            (Running, StagingIn) => true,
            (StagingIn, Ok) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::New => "new",
            JobState::StagingOut => "staging_out",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::StagingIn => "staging_in",
            JobState::Ok => "ok",
            JobState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// An authenticated identity, produced by the token-verification boundary
/// before any core call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub issuer: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>, issuer: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
            issuer: issuer.into(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A user-submitted unit of work bound to one application and one
/// destination for its entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub application: String,
    pub submitter: String,
    pub destination: String,
    pub state: JobState,
    /// Scheduler-native identifier, set exactly once when the job enters
    /// `queued`.
    pub internal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    /// Human-readable cause for terminal `error` states.
    pub reason: Option<String>,
}

impl Job {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        application: impl Into<String>,
        submitter: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            application: application.into(),
            submitter: submitter.into(),
            destination: destination.into(),
            state: JobState::New,
            internal_id: None,
            created_at: now,
            updated_at: now,
            exit_code: None,
            reason: None,
        }
    }
}
