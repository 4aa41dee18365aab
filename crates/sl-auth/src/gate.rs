// SPDX-License-Identifier: MIT OR Apache-2.0
//! The capability gate.
//!
//! `capability(user, module, action)` is the single authority consulted by
//! every mutating operation. Role rows come from a [`RoleProvider`] (master
//! data lives elsewhere); resolved roles are cached for 60 seconds behind an
//! immutable snapshot so reads never hold the write lock.

use crate::role::{Action, Capability, Module, Role};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sl_core::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How long a resolved role stays cached.
const CACHE_TTL_SECS: i64 = 60;

/// Hard cap on cached users; oldest half is evicted when exceeded.
const CACHE_CAP: usize = 1_000;

// ---------------------------------------------------------------------------
// RoleProvider
// ---------------------------------------------------------------------------

/// Source of user → role rows and credential checks.
///
/// Authentication and user master data are external collaborators; this
/// trait is their narrow interface.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    /// Resolve a user's role, or `None` for unknown users.
    async fn role_of(&self, user: UserId) -> Option<Role>;

    /// Check credentials and return the matching user and role.
    async fn authenticate(&self, email: &str, password: &str) -> Option<(UserId, Role)>;
}

/// In-memory provider for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryRoleProvider {
    users: Mutex<HashMap<UserId, (String, String, Role)>>,
}

impl InMemoryRoleProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with credentials and a role.
    pub fn add_user(&self, user: UserId, email: &str, password: &str, role: Role) {
        self.users
            .lock()
            .expect("role provider lock poisoned")
            .insert(user, (email.to_string(), password.to_string(), role));
    }
}

#[async_trait]
impl RoleProvider for InMemoryRoleProvider {
    async fn role_of(&self, user: UserId) -> Option<Role> {
        self.users
            .lock()
            .expect("role provider lock poisoned")
            .get(&user)
            .map(|(_, _, role)| *role)
    }

    async fn authenticate(&self, email: &str, password: &str) -> Option<(UserId, Role)> {
        self.users
            .lock()
            .expect("role provider lock poisoned")
            .iter()
            .find(|(_, (e, p, _))| e == email && p == password)
            .map(|(id, (_, _, role))| (*id, *role))
    }
}

// ---------------------------------------------------------------------------
// CapabilityGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CachedRole {
    role: Role,
    cached_at: DateTime<Utc>,
}

/// Successful login payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Bearer token for subsequent requests.
    pub token: String,
    /// The authenticated user.
    pub user: UserId,
    /// The user's role.
    pub role: Role,
    /// The role's full capability list.
    pub capabilities: Vec<Capability>,
}

/// The capability gate: role resolution with a TTL snapshot cache.
pub struct CapabilityGate {
    provider: Arc<dyn RoleProvider>,
    // Reads clone the Arc under a short lock and then work lock-free on the
    // immutable snapshot; writes build a new map and swap the pointer.
    cache: Mutex<Arc<HashMap<UserId, CachedRole>>>,
}

impl CapabilityGate {
    /// Create a gate over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn RoleProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(Arc::new(HashMap::new())),
        }
    }

    /// Whether `user` may perform `action` on `module`.
    ///
    /// Unknown users hold no capabilities.
    pub async fn capability(&self, user: UserId, module: Module, action: Action) -> bool {
        match self.role(user).await {
            Some(role) => role.allows(module, action),
            None => false,
        }
    }

    /// Resolve a user's role, consulting the cache first.
    pub async fn role(&self, user: UserId) -> Option<Role> {
        let now = Utc::now();
        let snapshot = {
            let guard = self.cache.lock().expect("gate cache lock poisoned");
            Arc::clone(&guard)
        };
        if let Some(cached) = snapshot.get(&user)
            && now - cached.cached_at < Duration::seconds(CACHE_TTL_SECS)
        {
            return Some(cached.role);
        }

        let role = self.provider.role_of(user).await?;
        self.insert(user, role, now);
        Some(role)
    }

    /// Drop a user's cached role, forcing re-resolution on the next check.
    pub fn invalidate(&self, user: UserId) {
        let mut guard = self.cache.lock().expect("gate cache lock poisoned");
        let mut next: HashMap<UserId, CachedRole> = (**guard).clone();
        next.remove(&user);
        *guard = Arc::new(next);
    }

    /// Authenticate and issue a token via the given validator.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        tokens: &crate::token::TokenValidator,
    ) -> Option<LoginResponse> {
        let (user, role) = self.provider.authenticate(email, password).await?;
        self.insert(user, role, Utc::now());
        Some(LoginResponse {
            token: tokens.issue(user, Duration::hours(12)),
            user,
            role,
            capabilities: role.capabilities().to_vec(),
        })
    }

    fn insert(&self, user: UserId, role: Role, now: DateTime<Utc>) {
        let mut guard = self.cache.lock().expect("gate cache lock poisoned");
        let mut next: HashMap<UserId, CachedRole> = (**guard).clone();
        if next.len() >= CACHE_CAP {
            // Evict the oldest half by cache time.
            let mut entries: Vec<(UserId, DateTime<Utc>)> =
                next.iter().map(|(id, c)| (*id, c.cached_at)).collect();
            entries.sort_by_key(|(_, at)| *at);
            for (id, _) in entries.into_iter().take(CACHE_CAP / 2) {
                next.remove(&id);
            }
            debug!(evicted = CACHE_CAP / 2, "capability cache eviction");
        }
        next.insert(
            user,
            CachedRole {
                role,
                cached_at: now,
            },
        );
        *guard = Arc::new(next);
    }
}
