use std::sync::{Arc, RwLock};

use time::OffsetDateTime;

use crate::entity::Auth;

/// Token material shared by the virtual siblings of a multi-project
/// credential.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expired: Option<OffsetDateTime>,
}

/// Refresh-token pool owned by a multi-project primary and referenced by each
/// virtual child through `Auth.runtime`.
///
/// The refresh loop is the single writer; siblings take the lock briefly to
/// re-read tokens after a refresh.
#[derive(Debug, Default)]
pub struct SharedTokenPool {
    tokens: RwLock<PoolTokens>,
}

impl SharedTokenPool {
    pub fn new(tokens: PoolTokens) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    pub fn snapshot(&self) -> PoolTokens {
        self.tokens.read().expect("token pool lock poisoned").clone()
    }

    pub fn store(&self, tokens: PoolTokens) {
        *self.tokens.write().expect("token pool lock poisoned") = tokens;
    }
}

impl Auth {
    /// Downcast the opaque runtime handle to the shared token pool, when this
    /// auth is a multi-project virtual.
    pub fn shared_pool(&self) -> Option<Arc<SharedTokenPool>> {
        self.runtime.as_ref()?.downcast::<SharedTokenPool>()
    }
}
