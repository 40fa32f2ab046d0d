use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured failure description carried by notifications, commands, and
/// failed sessions. Code ranges carry meaning; see [`codes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({})", description, self.code),
            None => write!(f, "reason code {}", self.code),
        }
    }
}

/// Well-known reason codes.
///
/// Ranges: 10-19 session errors, 20-29 validation errors, 30-39 authorization
/// errors. Anything else is a generic failure.
pub mod codes {
    pub const GENERAL_ERROR: i32 = 1;

    pub const SESSION_ERROR: i32 = 11;
    pub const SESSION_TIMEOUT: i32 = 12;
    pub const SESSION_AUTHENTICATION_FAILED: i32 = 13;

    pub const VALIDATION_ERROR: i32 = 21;
    pub const VALIDATION_INVALID_ENVELOPE: i32 = 22;

    pub const AUTHORIZATION_UNSUPPORTED_OPTION: i32 = 31;
}
