//! Moderation state: blocked connection ids and the abuse-report log.
//!
//! Blocks are keyed by connection id, not by person. A blocked user who
//! reconnects gets a fresh id and is no longer blocked; ids stay in the set
//! after disconnect so the same connection cannot shake the block off.
//! Reports are only collected for admin tooling, never acted on here.

use std::collections::HashSet;

use crate::protocol::{now_ms, ConnectionId, ReportRecord};

#[derive(Debug, Default)]
pub struct ModerationState {
    blocked: HashSet<ConnectionId>,
    reports: Vec<ReportRecord>,
}

impl ModerationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked.contains(id)
    }

    /// Returns `false` if the id was already blocked.
    pub fn block(&mut self, id: &str) -> bool {
        self.blocked.insert(id.to_string())
    }

    /// Returns `false` if the id was not blocked.
    pub fn unblock(&mut self, id: &str) -> bool {
        self.blocked.remove(id)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn record_report(&mut self, message_id: &str, reporter_name: &str) -> ReportRecord {
        let record = ReportRecord {
            message_id: message_id.to_string(),
            reported_by: reporter_name.to_string(),
            timestamp: now_ms(),
        };
        self.reports.push(record.clone());
        record
    }

    pub fn reports(&self) -> &[ReportRecord] {
        &self.reports
    }
}
