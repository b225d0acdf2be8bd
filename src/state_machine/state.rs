use std::fmt;

use serde::{Deserialize, Serialize};

/// The twelve states of a reelgate editing job.
///
/// A job flows: CREATED → INGESTING → INGESTED → ANALYZING → ANALYZED →
/// PLANNING → PLANNED → EXECUTING → EXPORTING → COMPLETED, with FAILED
/// reachable from every non-terminal stage and PAUSED from the long-running
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Ingesting,
    Ingested,
    Analyzing,
    Analyzed,
    Planning,
    Planned,
    Executing,
    Exporting,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    pub const ALL: [JobState; 12] = [
        JobState::Created,
        JobState::Ingesting,
        JobState::Ingested,
        JobState::Analyzing,
        JobState::Analyzed,
        JobState::Planning,
        JobState::Planned,
        JobState::Executing,
        JobState::Exporting,
        JobState::Completed,
        JobState::Failed,
        JobState::Paused,
    ];

    /// The declared transition table. Anything not listed here is illegal
    /// unless forced by an operator.
    pub fn allowed_transitions(&self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Created => &[Ingesting, Failed],
            Ingesting => &[Ingested, Failed],
            Ingested => &[Analyzing, Failed],
            Analyzing => &[Analyzed, Failed, Paused],
            Analyzed => &[Planning, Failed],
            Planning => &[Planned, Failed, Paused],
            Planned => &[Executing, Failed],
            Executing => &[Exporting, Failed, Paused],
            Exporting => &[Completed, Failed],
            Paused => &[Analyzing, Planning, Executing],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// States that hold the GPU and the editor exclusively.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, JobState::Executing | JobState::Exporting)
    }

    pub fn requirements(&self) -> StateRequirements {
        use JobState::*;
        use LoadLevel::*;
        let (cpu, gpu, editor, vision, ai) = match self {
            Created | Ingested | Analyzed | Planned => (Low, None, false, false, false),
            Ingesting => (Medium, Low, false, false, false),
            Analyzing => (Medium, Medium, false, true, false),
            Planning => (Low, None, false, false, true),
            Executing => (High, High, true, false, false),
            Exporting => (Critical, Critical, true, false, false),
            Completed | Failed | Paused => (None, None, false, false, false),
        };
        StateRequirements {
            cpu,
            gpu,
            editor,
            vision,
            ai,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Ingesting => "INGESTING",
            JobState::Ingested => "INGESTED",
            JobState::Analyzing => "ANALYZING",
            JobState::Analyzed => "ANALYZED",
            JobState::Planning => "PLANNING",
            JobState::Planned => "PLANNED",
            JobState::Executing => "EXECUTING",
            JobState::Exporting => "EXPORTING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Coarse load classes used in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// What a state expects from the host while a job sits in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequirements {
    pub cpu: LoadLevel,
    pub gpu: LoadLevel,
    /// Needs the external editor for itself.
    pub editor: bool,
    pub vision: bool,
    pub ai: bool,
}
