//! Block-rule evaluation: pattern + scope + subnet + expiry.
//!
//! Mirrors `is_domain_blocked` from the original Python proxy's `crud`
//! module, reworked against the async `RuleStore` trait instead of a
//! database session.

use std::net::IpAddr;
use std::sync::Arc;

use crate::rules::{RuleStore, Scope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Evaluates `(host, client_ip)` against the active rules in a `RuleStore`.
pub struct PolicyEngine {
    store: Arc<dyn RuleStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Evaluate a request. First matching rule in store iteration order
    /// wins; callers must not rely on a specific order across ties.
    pub async fn evaluate(&self, host: &str, client_ip: Option<IpAddr>) -> Decision {
        let host_lower = host.to_lowercase();
        let rules = self.store.list_active().await;

        for rule in &rules {
            if !host_lower.contains(&rule.pattern) {
                continue;
            }

            match rule.scope {
                Scope::Global => {
                    return Decision::Block(format!("Blocked globally: {}", rule.pattern));
                }
                Scope::Subnet => {
                    if let (Some(ip), Some(subnet)) = (client_ip, rule.subnet) {
                        if subnet.contains(&ip) {
                            return Decision::Block(format!(
                                "Blocked for subnet {}: {}",
                                subnet, rule.pattern
                            ));
                        }
                    }
                }
            }
        }

        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{InMemoryRuleStore, NewRule};

    async fn engine_with(rules: Vec<NewRule>) -> PolicyEngine {
        let store = InMemoryRuleStore::shared();
        for rule in rules {
            store.add(rule).await;
        }
        PolicyEngine::new(store)
    }

    #[tokio::test]
    async fn global_rule_blocks_by_substring() {
        let engine = engine_with(vec![NewRule {
            pattern: "ads.example".into(),
            scope: Scope::Global,
            ..Default::default()
        }])
        .await;

        let decision = engine.evaluate("ads.example.net", None).await;
        assert_eq!(
            decision,
            Decision::Block("Blocked globally: ads.example".into())
        );
    }

    #[tokio::test]
    async fn global_rule_is_case_insensitive() {
        let engine = engine_with(vec![NewRule {
            pattern: "ads.example".into(),
            scope: Scope::Global,
            ..Default::default()
        }])
        .await;
        assert!(!engine.evaluate("ADS.EXAMPLE.NET", None).await.is_allowed());
    }

    #[tokio::test]
    async fn subnet_rule_blocks_only_matching_client() {
        let engine = engine_with(vec![NewRule {
            pattern: "news".into(),
            scope: Scope::Subnet,
            subnet: "10.0.0.0/8".parse().ok(),
            ..Default::default()
        }])
        .await;

        let blocked = engine
            .evaluate("news.site", Some("10.1.2.3".parse().unwrap()))
            .await;
        assert!(!blocked.is_allowed());

        let allowed = engine
            .evaluate("news.site", Some("192.168.1.5".parse().unwrap()))
            .await;
        assert!(allowed.is_allowed());
    }

    #[tokio::test]
    async fn subnet_rule_without_client_ip_never_blocks() {
        let engine = engine_with(vec![NewRule {
            pattern: "news".into(),
            scope: Scope::Subnet,
            subnet: "10.0.0.0/8".parse().ok(),
            ..Default::default()
        }])
        .await;
        assert!(engine.evaluate("news.site", None).await.is_allowed());
    }

    #[tokio::test]
    async fn expired_rule_never_blocks() {
        let engine = engine_with(vec![NewRule {
            pattern: "facebook".into(),
            scope: Scope::Global,
            expires_in_seconds: Some(-1),
            ..Default::default()
        }])
        .await;
        assert!(engine.evaluate("facebook.com", None).await.is_allowed());
    }

    #[tokio::test]
    async fn no_matching_rule_allows() {
        let engine = engine_with(vec![]).await;
        assert!(engine.evaluate("example.com", None).await.is_allowed());
    }
}
