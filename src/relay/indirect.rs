//! Indirect-query ledger
//!
//! Remote displays that asked for a chooser go through an indirection
//! step: the origin queries us, the chooser picks a host, and the next
//! query from the same origin must be forwarded to that host. This module
//! keeps those pending records. The network side lives elsewhere; only the
//! chosen-host bookkeeping is consumed here.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::debug;

/// One pending indirect query.
#[derive(Debug, Clone)]
pub struct IndirectRecord {
    /// Ledger-assigned id, echoed by the chooser protocol.
    pub id: u32,
    /// Origin address of the querying display.
    pub origin: IpAddr,
    /// Host picked by the chooser, once known.
    pub chosen_host: Option<IpAddr>,
    last_access: Instant,
}

/// Pending indirect queries with expiry and a population ceiling.
pub struct IndirectLedger {
    records: Vec<IndirectRecord>,
    next_id: u32,
    max_pending: usize,
    timeout: Duration,
}

impl IndirectLedger {
    /// New ledger evicting entries older than `timeout` and capping the
    /// population at `max_pending`.
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self { records: Vec::new(), next_id: 1, max_pending, timeout }
    }

    /// Register (or refresh) the record for an origin. When the ceiling is
    /// hit, the stalest record is evicted first.
    pub fn register(&mut self, origin: IpAddr, now: Instant) -> u32 {
        self.expire(now);
        if let Some(rec) = self.records.iter_mut().find(|r| r.origin == origin) {
            rec.last_access = now;
            return rec.id;
        }
        if self.records.len() >= self.max_pending {
            if let Some(oldest) = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.last_access)
                .map(|(i, _)| i)
            {
                let evicted = self.records.remove(oldest);
                debug!(origin = %evicted.origin, "indirect ledger full, evicting oldest");
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.records.push(IndirectRecord { id, origin, chosen_host: None, last_access: now });
        id
    }

    /// Record the chooser's pick for an origin.
    pub fn set_chosen(&mut self, id: u32, host: IpAddr, now: Instant) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(rec) => {
                rec.chosen_host = Some(host);
                rec.last_access = now;
                true
            }
            None => false,
        }
    }

    /// Look up and consume the chosen host for an origin. A second query
    /// from the same origin starts over with a fresh chooser.
    pub fn take_chosen(&mut self, origin: IpAddr, now: Instant) -> Option<IpAddr> {
        self.expire(now);
        let idx = self
            .records
            .iter()
            .position(|r| r.origin == origin && r.chosen_host.is_some())?;
        let rec = self.records.remove(idx);
        rec.chosen_host
    }

    /// Drop records idle longer than the timeout.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.records.retain(|r| now.duration_since(r.last_access) <= timeout);
    }

    /// Current number of pending records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger has no pending records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn chosen_host_roundtrip_is_consumed() {
        let mut ledger = IndirectLedger::new(8, Duration::from_secs(900));
        let t0 = Instant::now();
        let id = ledger.register(ip(1), t0);
        assert!(ledger.set_chosen(id, ip(200), t0));
        assert_eq!(ledger.take_chosen(ip(1), t0), Some(ip(200)));
        assert_eq!(ledger.take_chosen(ip(1), t0), None, "lookup consumes the record");
    }

    #[test]
    fn reregistering_refreshes_instead_of_duplicating() {
        let mut ledger = IndirectLedger::new(8, Duration::from_secs(900));
        let t0 = Instant::now();
        let id1 = ledger.register(ip(1), t0);
        let id2 = ledger.register(ip(1), t0 + Duration::from_secs(5));
        assert_eq!(id1, id2);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn records_expire_after_timeout() {
        let mut ledger = IndirectLedger::new(8, Duration::from_secs(60));
        let t0 = Instant::now();
        let id = ledger.register(ip(1), t0);
        ledger.set_chosen(id, ip(200), t0);
        assert_eq!(ledger.take_chosen(ip(1), t0 + Duration::from_secs(61)), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn ceiling_evicts_oldest_first() {
        let mut ledger = IndirectLedger::new(2, Duration::from_secs(900));
        let t0 = Instant::now();
        ledger.register(ip(1), t0);
        ledger.register(ip(2), t0 + Duration::from_secs(1));
        ledger.register(ip(3), t0 + Duration::from_secs(2));
        assert_eq!(ledger.len(), 2);
        // ip(1) was stalest and must be the one gone.
        let id = ledger.register(ip(1), t0 + Duration::from_secs(3));
        assert!(id > 2, "origin 1 had to re-register from scratch");
    }
}
