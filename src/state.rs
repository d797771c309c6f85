//! Process-wide collaborators shared by every `ConnectionHandler`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustls::{ClientConfig, RootCertStore};

use crate::cache::ResponseCache;
use crate::certs::CertificateMint;
use crate::filter::{ContentFilter, NoopContentFilter};
use crate::policy::PolicyEngine;
use crate::rules::RuleStore;
use crate::traffic::TrafficLog;

/// Hit/miss counters for the response cache, surfaced on the admin page.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

pub struct ProxyState {
    pub rule_store: Arc<dyn RuleStore>,
    pub policy: PolicyEngine,
    pub certs: Arc<CertificateMint>,
    pub cache: Arc<ResponseCache>,
    pub traffic: Arc<dyn TrafficLog>,
    pub content_filter: Arc<dyn ContentFilter>,
    pub cache_stats: Arc<CacheStats>,
    pub tls_client_config: Arc<ClientConfig>,
    pub listen_addr: String,
    pub started_at: Instant,
}

impl ProxyState {
    pub fn new(
        rule_store: Arc<dyn RuleStore>,
        certs: Arc<CertificateMint>,
        cache: Arc<ResponseCache>,
        traffic: Arc<dyn TrafficLog>,
        listen_addr: String,
    ) -> Self {
        let policy = PolicyEngine::new(rule_store.clone());

        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );

        Self {
            rule_store,
            policy,
            certs,
            cache,
            traffic,
            content_filter: Arc::new(NoopContentFilter),
            cache_stats: Arc::new(CacheStats::default()),
            tls_client_config,
            listen_addr,
            started_at: Instant::now(),
        }
    }

    pub fn with_content_filter(mut self, filter: Arc<dyn ContentFilter>) -> Self {
        self.content_filter = filter;
        self
    }
}
