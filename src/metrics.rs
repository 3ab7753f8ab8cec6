//! Atomic counters and gauges, rendered in Prometheus text format

use crate::types::EnforcementAction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct MetricsRegistry {
    start_time: Instant,

    // Matchmaking
    pub tickets_enqueued: AtomicU64,
    pub tickets_timed_out: AtomicU64,
    pub matches_formed: AtomicU64,
    pub duplicate_matches: AtomicU64,

    // Rooms
    pub rooms_created: AtomicU64,
    pub rooms_active: AtomicU64,
    pub rooms_ended: AtomicU64,
    pub rooms_disqualified: AtomicU64,

    // Settlement
    pub sessions_validated: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub collaborator_failures: AtomicU64,

    // Anti-cheat verdicts by action
    pub verdicts_warn: AtomicU64,
    pub verdicts_kick: AtomicU64,
    pub verdicts_ban: AtomicU64,

    // Gateway
    pub connections_active: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_rejected: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            tickets_enqueued: AtomicU64::new(0),
            tickets_timed_out: AtomicU64::new(0),
            matches_formed: AtomicU64::new(0),
            duplicate_matches: AtomicU64::new(0),
            rooms_created: AtomicU64::new(0),
            rooms_active: AtomicU64::new(0),
            rooms_ended: AtomicU64::new(0),
            rooms_disqualified: AtomicU64::new(0),
            sessions_validated: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            collaborator_failures: AtomicU64::new(0),
            verdicts_warn: AtomicU64::new(0),
            verdicts_kick: AtomicU64::new(0),
            verdicts_ban: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(gauge: &AtomicU64) {
        // Saturating so a double close can't wrap the gauge
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn record_verdict(&self, action: EnforcementAction) {
        match action {
            EnforcementAction::None => {}
            EnforcementAction::Warn => Self::incr(&self.verdicts_warn),
            EnforcementAction::Kick => Self::incr(&self.verdicts_kick),
            EnforcementAction::Ban => Self::incr(&self.verdicts_ban),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus_format(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 15] = [
            ("arena_tickets_enqueued_total", "Matchmaking tickets accepted", &self.tickets_enqueued),
            ("arena_tickets_timed_out_total", "Tickets that expired without a match", &self.tickets_timed_out),
            ("arena_matches_formed_total", "Match formations emitted by the queue", &self.matches_formed),
            ("arena_duplicate_matches_total", "Rejected formations reusing a ticket", &self.duplicate_matches),
            ("arena_rooms_created_total", "Rooms created", &self.rooms_created),
            ("arena_rooms_ended_total", "Rooms settled and ended", &self.rooms_ended),
            ("arena_rooms_disqualified_total", "Rooms disqualified", &self.rooms_disqualified),
            ("arena_sessions_validated_total", "Sessions whose score was validated", &self.sessions_validated),
            ("arena_sessions_rejected_total", "Sessions whose score failed validation", &self.sessions_rejected),
            ("arena_collaborator_failures_total", "Wallet, hardware or enforcement calls that failed", &self.collaborator_failures),
            ("arena_verdicts_warn_total", "Anti-cheat warn verdicts", &self.verdicts_warn),
            ("arena_verdicts_kick_total", "Anti-cheat kick verdicts", &self.verdicts_kick),
            ("arena_verdicts_ban_total", "Anti-cheat ban verdicts", &self.verdicts_ban),
            ("arena_messages_received_total", "Realtime messages received", &self.messages_received),
            ("arena_messages_rejected_total", "Realtime messages rejected", &self.messages_rejected),
        ];
        let gauges: [(&str, &str, &AtomicU64); 2] = [
            ("arena_rooms_active", "Rooms currently live", &self.rooms_active),
            ("arena_connections_active", "Open realtime connections", &self.connections_active),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                value.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "# HELP arena_messages_sent_total Realtime messages delivered\n\
             # TYPE arena_messages_sent_total counter\n\
             arena_messages_sent_total {}\n\n",
            self.messages_sent.load(Ordering::Relaxed)
        ));
        for (name, help, value) in gauges {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n\n",
                value.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "# HELP arena_uptime_seconds Seconds since start\n\
             # TYPE arena_uptime_seconds gauge\n\
             arena_uptime_seconds {}\n",
            self.uptime_secs()
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_output() {
        let metrics = MetricsRegistry::new();
        MetricsRegistry::incr(&metrics.rooms_created);
        MetricsRegistry::incr(&metrics.rooms_active);
        MetricsRegistry::decr(&metrics.rooms_active);
        MetricsRegistry::decr(&metrics.rooms_active);
        metrics.record_verdict(EnforcementAction::Ban);
        metrics.record_verdict(EnforcementAction::None);

        let text = metrics.to_prometheus_format();
        assert!(text.contains("arena_rooms_created_total 1\n"));
        assert!(text.contains("arena_rooms_active 0\n"));
        assert!(text.contains("arena_verdicts_ban_total 1\n"));
        assert!(text.contains("# TYPE arena_connections_active gauge"));
    }
}
