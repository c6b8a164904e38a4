//! Leader Election Port
//!
//! Election mechanics live elsewhere; the core only needs to know whether
//! the token it took at round start is still valid at the moment it would
//! publish. Plans computed under an expired token are discarded silently.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderToken(Uuid);

impl LeaderToken {
    pub fn new() -> Self {
        LeaderToken(Uuid::new_v4())
    }
}

impl Default for LeaderToken {
    fn default() -> Self {
        Self::new()
    }
}

pub trait LeaderController: Send + Sync {
    /// The current token, or `None` when this instance is not the leader.
    fn token(&self) -> Option<LeaderToken>;

    /// Whether `token` still confers leadership.
    fn validate(&self, token: LeaderToken) -> bool;
}

/// Always-leader controller for single-instance deployments and tests.
#[derive(Debug)]
pub struct StandaloneLeaderController {
    token: LeaderToken,
}

impl StandaloneLeaderController {
    pub fn new() -> Self {
        StandaloneLeaderController {
            token: LeaderToken::new(),
        }
    }
}

impl Default for StandaloneLeaderController {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderController for StandaloneLeaderController {
    fn token(&self) -> Option<LeaderToken> {
        Some(self.token)
    }

    fn validate(&self, token: LeaderToken) -> bool {
        token == self.token
    }
}
