//! Block rules: the persisted policy data `PolicyEngine` evaluates against.
//!
//! `RuleStore` is the abstract collaborator spec'd at the core's boundary —
//! the GUI and the database live outside this crate. [`InMemoryRuleStore`]
//! is the reference implementation used to run the proxy standalone and to
//! exercise the property tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type RuleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Subnet,
}

#[derive(Debug, Clone)]
pub struct BlockRule {
    pub id: RuleId,
    pub pattern: String,
    pub scope: Scope,
    pub subnet: Option<IpNet>,
    pub reason: Option<String>,
    pub added_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockRule {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => exp > now,
            None => true,
        }
    }
}

/// Fields accepted by `RuleStore::add`, mirroring the facade in spec §4.6.
#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub pattern: String,
    pub scope: Scope,
    pub subnet: Option<IpNet>,
    pub reason: Option<String>,
    pub added_by: Option<String>,
    pub expires_in_seconds: Option<i64>,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Global
    }
}

/// Fields accepted by `RuleStore::update`; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub pattern: Option<String>,
    pub scope: Option<Scope>,
    pub subnet: Option<Option<IpNet>>,
    pub reason: Option<String>,
    pub added_by: Option<String>,
    pub expires_in_seconds: Option<Option<i64>>,
}

/// Persisted block-rule storage. The core only depends on this trait: the
/// concrete backing store (database, admin GUI, ...) is external.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn add(&self, rule: NewRule) -> RuleId;
    async fn update(&self, id: RuleId, update: RuleUpdate) -> bool;
    async fn delete(&self, id: RuleId);
    async fn list_active(&self) -> Vec<BlockRule>;
}

/// In-memory `RuleStore`. `add` deliberately does not deduplicate patterns —
/// that policy is an explicit non-goal of the rule store.
pub struct InMemoryRuleStore {
    next_id: AtomicU64,
    rules: RwLock<HashMap<RuleId, BlockRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn add(&self, rule: NewRule) -> RuleId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created_at = Utc::now();
        let expires_at = rule
            .expires_in_seconds
            .map(|secs| created_at + chrono::Duration::seconds(secs));

        let record = BlockRule {
            id,
            pattern: rule.pattern.to_lowercase(),
            scope: rule.scope,
            subnet: rule.subnet,
            reason: rule.reason,
            added_by: rule.added_by,
            created_at,
            expires_at,
        };

        self.rules.write().await.insert(id, record);
        id
    }

    async fn update(&self, id: RuleId, update: RuleUpdate) -> bool {
        let mut rules = self.rules.write().await;
        let Some(rule) = rules.get_mut(&id) else {
            return false;
        };

        if let Some(pattern) = update.pattern {
            rule.pattern = pattern.to_lowercase();
        }
        if let Some(scope) = update.scope {
            rule.scope = scope;
        }
        if let Some(subnet) = update.subnet {
            rule.subnet = subnet;
        }
        if let Some(reason) = update.reason {
            rule.reason = Some(reason);
        }
        if let Some(added_by) = update.added_by {
            rule.added_by = Some(added_by);
        }
        if let Some(expires_in_seconds) = update.expires_in_seconds {
            rule.expires_at =
                expires_in_seconds.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        }
        true
    }

    async fn delete(&self, id: RuleId) {
        self.rules.write().await.remove(&id);
    }

    async fn list_active(&self) -> Vec<BlockRule> {
        let now = Utc::now();
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.is_active(now))
            .cloned()
            .collect()
    }
}
