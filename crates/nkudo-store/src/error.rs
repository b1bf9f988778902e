//! Error type for the store layer.

/// Errors from repository operations.
///
/// Domain-level redemption failures (`TokenInvalid` / `TokenExpired` /
/// `TokenAlreadyUsed`) are store errors because the check happens inside
/// the same transaction that consumes the token — the caller must not be
/// able to observe a gap between validation and consumption.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// A uniqueness or ownership constraint was violated.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The enrollment token does not exist or its secret does not verify.
    #[error("enrollment token invalid")]
    TokenInvalid,

    /// The enrollment token's expiry has passed.
    #[error("enrollment token expired")]
    TokenExpired,

    /// The enrollment token was already consumed.
    #[error("enrollment token already used")]
    TokenAlreadyUsed,

    /// The operation's preconditions were not met.
    #[error("invalid store operation: {reason}")]
    Invalid { reason: String },

    /// A persisted value failed to (de)serialize.
    #[error("serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying backend failed.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },
}

impl StoreError {
    /// Shorthand for a [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

#[cfg(feature = "postgres-backend")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound {
                what: "row".to_owned(),
            },
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict {
                        reason: "row already exists".to_owned(),
                    }
                } else {
                    Self::Backend {
                        reason: format!("database error: {db_err}"),
                    }
                }
            }
            _ => Self::Backend {
                reason: format!("database error: {err}"),
            },
        }
    }
}
