//! Invocation identity: which build session a connection belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one build session.
///
/// Created once per session and never mutated. Both the orchestrator and every
/// worker hold one; Attach compares them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationIdentity {
    /// Opaque session token (UUID string when generated)
    pub session_id: String,

    /// Free-form environment label (e.g. "ci-linux", "dev")
    pub environment: String,
}

/// Result of comparing two identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMatch {
    /// Both fields match
    Identical,
    /// Same session, different environment: the call fails but the
    /// connection survives
    TolerableMismatch,
    /// Different session: the connection must be torn down
    UnrecoverableMismatch,
}

impl IdentityMatch {
    pub fn as_str(&self) -> &str {
        match self {
            IdentityMatch::Identical => "identical",
            IdentityMatch::TolerableMismatch => "tolerable_mismatch",
            IdentityMatch::UnrecoverableMismatch => "unrecoverable_mismatch",
        }
    }
}

impl InvocationIdentity {
    pub fn new(session_id: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            environment: environment.into(),
        }
    }

    /// Create an identity with a fresh random session id
    pub fn generate(environment: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), environment)
    }

    /// Compare `other` against this identity.
    ///
    /// A session mismatch is unrecoverable whatever the environments are.
    pub fn compare(&self, other: &InvocationIdentity) -> IdentityMatch {
        if self.session_id != other.session_id {
            IdentityMatch::UnrecoverableMismatch
        } else if self.environment != other.environment {
            IdentityMatch::TolerableMismatch
        } else {
            IdentityMatch::Identical
        }
    }
}

impl fmt::Display for InvocationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_id, self.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical() {
        let a = InvocationIdentity::new("s-1", "ci");
        assert_eq!(a.compare(&a.clone()), IdentityMatch::Identical);
    }

    #[test]
    fn test_environment_only_mismatch_is_tolerable() {
        let a = InvocationIdentity::new("s-1", "ci");
        let b = InvocationIdentity::new("s-1", "dev");
        assert_eq!(a.compare(&b), IdentityMatch::TolerableMismatch);
        assert_eq!(b.compare(&a), IdentityMatch::TolerableMismatch);
    }

    #[test]
    fn test_session_mismatch_wins_over_environment() {
        let a = InvocationIdentity::new("s-1", "ci");
        assert_eq!(
            a.compare(&InvocationIdentity::new("s-2", "ci")),
            IdentityMatch::UnrecoverableMismatch
        );
        assert_eq!(
            a.compare(&InvocationIdentity::new("s-2", "dev")),
            IdentityMatch::UnrecoverableMismatch
        );
    }

    #[test]
    fn test_generate_uses_distinct_sessions() {
        let a = InvocationIdentity::generate("ci");
        let b = InvocationIdentity::generate("ci");
        assert_ne!(a.session_id, b.session_id);
        assert!(Uuid::parse_str(&a.session_id).is_ok());
    }

    #[test]
    fn test_display() {
        let a = InvocationIdentity::new("s-1", "ci");
        assert_eq!(a.to_string(), "s-1@ci");
    }
}
