//! Auth error types.

/// Reasons a token could not be resolved to an account.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The upstream request failed or timed out.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The account service answered with a non-200 status.
    #[error("token rejected ({status})")]
    Rejected {
        /// HTTP status code returned upstream.
        status: u16,
    },

    /// The response body was not the expected JSON.
    #[error("malformed token info: {0}")]
    Decode(#[from] serde_json::Error),

    /// The response parsed but carried no account id.
    #[error("token info has no account id")]
    MissingAccount,
}

impl AuthError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
            Self::MissingAccount => "missing_account",
        }
    }
}
