//! Append-only traffic log of completed proxy transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "CONNECT" => Some(Method::Connect),
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Connect => "CONNECT",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub time: DateTime<Utc>,
    pub method: Method,
    pub url: String,
    pub client_ip: Option<String>,
}

/// Optional query narrowing for `TrafficLog::query`/`count`.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilter {
    pub host_contains: Option<String>,
    pub client_ip: Option<String>,
}

impl TrafficFilter {
    fn matches(&self, record: &TrafficRecord) -> bool {
        if let Some(needle) = &self.host_contains {
            if !record.url.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(ip) = &self.client_ip {
            if record.client_ip.as_deref() != Some(ip.as_str()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait TrafficLog: Send + Sync {
    async fn append(&self, method: Method, url: String, client_ip: Option<String>);
    async fn query(&self, filter: Option<TrafficFilter>, limit: usize, offset: usize)
    -> Vec<TrafficRecord>;
    async fn count(&self, filter: Option<TrafficFilter>) -> usize;
    async fn purge_older_than(&self, days: i64);
}

/// In-memory reference `TrafficLog`, newest records first.
pub struct InMemoryTrafficLog {
    records: RwLock<Vec<TrafficRecord>>,
}

impl InMemoryTrafficLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryTrafficLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrafficLog for InMemoryTrafficLog {
    async fn append(&self, method: Method, url: String, client_ip: Option<String>) {
        let mut records = self.records.write().await;
        records.push(TrafficRecord {
            time: Utc::now(),
            method,
            url,
            client_ip,
        });
    }

    async fn query(
        &self,
        filter: Option<TrafficFilter>,
        limit: usize,
        offset: usize,
    ) -> Vec<TrafficRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| filter.as_ref().map(|f| f.matches(r)).unwrap_or(true))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn count(&self, filter: Option<TrafficFilter>) -> usize {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| filter.as_ref().map(|f| f.matches(r)).unwrap_or(true))
            .count()
    }

    async fn purge_older_than(&self, days: i64) {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        self.records.write().await.retain(|r| r.time > cutoff);
    }
}
