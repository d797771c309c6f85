//! `GET /proxy-admin` plain-text status page.

use crate::state::ProxyState;

pub async fn render(state: &ProxyState) -> String {
    let rule_count = state.rule_store.list_active().await.len();
    let traffic_count = state.traffic.count(None).await;
    let (hits, misses) = state.cache_stats.snapshot();
    let uptime = state.started_at.elapsed().as_secs();

    format!(
        "mitm-proxy status\n\
         listening on: {}\n\
         uptime_seconds: {uptime}\n\
         active_rules: {rule_count}\n\
         traffic_records: {traffic_count}\n\
         cache_hits: {hits}\n\
         cache_misses: {misses}\n",
        state.listen_addr,
    )
}
