use thiserror::Error;

/// Failures talking to the plan-drafting model.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// HTTP 429.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("planner returned no choices")]
    EmptyResponse,

    /// The model answered, but not with a JSON object.
    #[error("planner returned invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("planner API key is not configured")]
    MissingApiKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = PlannerError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = PlannerError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PlannerError>();
    }
}
