mod job;
mod locks;
mod state;

pub use job::{Job, JobUpdate, StateEntry};
pub use locks::{LockMap, Resource, ResourceLock};
pub use state::{JobState, LoadLevel, StateRequirements};
