//! Authentication boundary.
//!
//! Real session handling lives outside this service; a connection only
//! carries an opaque token, and an `Auther` turns it into a user id. The
//! shipped implementation is a static token table from the service config.

use std::collections::HashMap;

use thiserror::Error;

use crate::core::UserId;

pub trait Auther: Send + Sync {
    /// Resolve connection credentials to a user id. No token means the
    /// anonymous user; whether uid 0 may actually see anything is decided by
    /// the permission index, not here.
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Token table authentication.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: HashMap<String, UserId>,
}

impl TokenTable {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }
}

impl Auther for TokenTable {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        match token {
            None => Ok(0),
            Some(token) => self
                .tokens
                .get(token)
                .copied()
                .ok_or(AuthError::InvalidToken),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}
