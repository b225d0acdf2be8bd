use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

/// One entry of a job's append-only state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    /// Set when an operator pushed the job past the transition table.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
}

/// Persisted record of one editing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub state: JobState,
    /// Free-form label; follows the state name unless a caller overrides it.
    pub status: String,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub state_history: Vec<StateEntry>,
}

impl Job {
    pub fn new() -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            job_id: format!("job_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8]),
            state: JobState::Created,
            status: JobState::Created.as_str().to_lowercase(),
            progress: 0,
            created_at: now,
            updated_at: now,
            error: None,
            result: None,
            state_history: vec![StateEntry {
                state: JobState::Created,
                timestamp: now,
                forced: false,
            }],
        }
    }

    /// Move to `state` and append it to the history. The history is never
    /// rewritten.
    pub fn record_transition(&mut self, state: JobState, forced: bool) {
        let now = Utc::now();
        self.state = state;
        self.status = state.as_str().to_lowercase();
        self.updated_at = now;
        self.state_history.push(StateEntry {
            state,
            timestamp: now,
            forced,
        });
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial update applied by [`JobStore::update`](crate::store::JobStore::update).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<String>,
    pub progress: Option<u8>,
    pub error: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub state: Option<JobState>,
}
