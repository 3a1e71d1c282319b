//! Aggregate connection statistics.

use serde::Serialize;

/// Gateway-wide counters, summed over live connections unless noted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Registered connections in any state.
    pub total_connections: usize,
    /// Connections in the `Connected` state.
    pub connected_connections: usize,
    /// Connected, open, responsive and under the error limit.
    pub healthy_connections: usize,
    /// Mean ping round trip over connections that answered a ping, 0 if none.
    pub average_latency_ms: u64,
    /// Frames written to transports.
    pub messages_sent: u64,
    /// Inbound text frames received.
    pub messages_received: u64,
    /// Messages currently waiting in outbound queues.
    pub queued_messages: usize,
    /// Messages evicted from full queues since startup.
    pub dropped_messages: u64,
    /// Write failures and malformed frames.
    pub error_count: u64,
    /// Connections registered since startup.
    pub lifetime_connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let stats = ConnectionStats {
            total_connections: 3,
            queued_messages: 7,
            ..ConnectionStats::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["totalConnections"], 3);
        assert_eq!(json["queuedMessages"], 7);
        assert_eq!(json["lifetimeConnections"], 0);
        assert_eq!(json["averageLatencyMs"], 0);
        assert!(json.get("total_connections").is_none());
    }
}
