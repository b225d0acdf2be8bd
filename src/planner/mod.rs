//! Drafting edit plans with a language model. Output is untrusted and must
//! go through the DSL validator before use.

pub mod client;
pub mod error;
mod prompt;
pub mod types;

use serde_json::Value;

pub use client::ChatPlanner;
pub use error::PlannerError;
pub use types::{PlanRequest, TranscriptSegment};

pub trait PlanDrafter {
    fn draft(
        &self,
        request: &PlanRequest,
    ) -> impl std::future::Future<Output = Result<Value, PlannerError>> + Send;
}
