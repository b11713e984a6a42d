//! Broker runtime statistics.
//!
//! Every figure is a [`Counter`]: a gauge paired with its peak value. Message
//! flow counters only grow (`added`, `delivered`, ...), resident counters move
//! both ways (`pending`, `inflights`, `cache_hard`, ...).

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub messages_added: Counter,
    pub messages_delivered: Counter,
    pub messages_acked: Counter,
    pub messages_redelivered: Counter,
    pub messages_expired: Counter,
    pub messages_dropped: Counter,
    pub pending: Counter,
    pub inflights: Counter,
    pub sessions: Counter,
    pub subscriptions: Counter,
    pub transactions: Counter,

    pub cache_hard: Counter,
    pub cache_soft: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_softened: Counter,
    pub cache_reclaimed: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "messages.added": self.messages_added.count(),
            "messages.delivered": self.messages_delivered.count(),
            "messages.acked": self.messages_acked.count(),
            "messages.redelivered": self.messages_redelivered.count(),
            "messages.expired": self.messages_expired.count(),
            "messages.dropped": self.messages_dropped.count(),

            "pending.count": self.pending.count(),
            "pending.max": self.pending.max(),
            "inflights.count": self.inflights.count(),
            "inflights.max": self.inflights.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "transactions.count": self.transactions.count(),
            "transactions.max": self.transactions.max(),

            "cache.hard": self.cache_hard.count(),
            "cache.soft": self.cache_soft.count(),
            "cache.hits": self.cache_hits.count(),
            "cache.misses": self.cache_misses.count(),
            "cache.softened": self.cache_softened.count(),
            "cache.reclaimed": self.cache_reclaimed.count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_snapshot() {
        let stats = Stats::new();
        stats.pending.incs(3);
        stats.pending.dec();
        stats.cache_misses.inc();
        let v = stats.to_json();
        assert_eq!(v["pending.count"], 2);
        assert_eq!(v["pending.max"], 3);
        assert_eq!(v["cache.misses"], 1);
    }
}
