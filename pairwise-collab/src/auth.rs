//! Identity collaborator.
//!
//! The gateway hands whatever credentials the handshake carried to an
//! [`Authenticator`] and gets back `(userId, role)` or an [`AuthError`].
//! [`StaticTokens`] is the bundled implementation used by the server binary
//! and the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

use crate::protocol::{Role, UserId};

/// Credentials extracted from the handshake request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Resolved identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credentials supplied")]
    Missing,
    #[error("credentials rejected")]
    Invalid,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user_id: impl Into<UserId>, role: Role) -> Self {
        self.insert(token, user_id, role);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: impl Into<UserId>, role: Role) {
        self.tokens.insert(
            token.into(),
            Identity {
                user_id: user_id.into(),
                role,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected TOKEN=USER:ROLE, got {0:?}")]
pub struct TokenSpecError(String);

impl FromStr for StaticTokens {
    type Err = TokenSpecError;

    /// Parse a comma separated list of `TOKEN=USER:ROLE` entries.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = StaticTokens::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, identity) = parse_entry(entry)?;
            tokens.tokens.insert(token, identity);
        }
        Ok(tokens)
    }
}

/// Parse one `TOKEN=USER:ROLE` entry.
pub fn parse_entry(entry: &str) -> Result<(String, Identity), TokenSpecError> {
    let bad = || TokenSpecError(entry.to_string());
    let (token, rest) = entry.split_once('=').ok_or_else(bad)?;
    let (user, role) = rest.rsplit_once(':').ok_or_else(bad)?;
    if token.is_empty() || user.is_empty() {
        return Err(bad());
    }
    let role = role.parse::<Role>().map_err(|_| bad())?;
    Ok((
        token.to_string(),
        Identity {
            user_id: user.to_string(),
            role,
        },
    ))
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let token = credentials.token.as_deref().ok_or(AuthError::Missing)?;
        self.tokens.get(token).cloned().ok_or(AuthError::Invalid)
    }
}
