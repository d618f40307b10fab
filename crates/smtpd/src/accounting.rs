//! Counts open connections, in total and per source address, and
//! enforces the configured ceilings at accept time.
use crate::metrics::CONNECTIONS_ACTIVE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    #[error("connection limit of {0} reached")]
    TotalLimit(usize),
    #[error("per-source connection limit of {0} reached")]
    SourceLimit(usize),
}

impl Refusal {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TotalLimit(_) => "connection_limit",
            Self::SourceLimit(_) => "source_limit",
        }
    }
}

#[derive(Default, Debug)]
struct Counts {
    total: usize,
    per_source: HashMap<IpAddr, usize>,
}

#[derive(Clone, Debug)]
pub struct ConnectionAccounting {
    counts: Arc<Mutex<Counts>>,
    limit: Option<usize>,
    limit_per_source: Option<usize>,
}

impl ConnectionAccounting {
    pub fn new(limit: Option<usize>, limit_per_source: Option<usize>) -> Self {
        Self {
            counts: Arc::new(Mutex::new(Counts::default())),
            limit,
            limit_per_source,
        }
    }

    /// Count a new connection from `addr`, unless doing so would
    /// exceed a ceiling. The connection stays counted until the
    /// returned ticket is dropped.
    pub fn try_admit(&self, addr: IpAddr) -> Result<ConnectionTicket, Refusal> {
        let addr = addr.to_canonical();
        let mut counts = self.counts.lock();
        if let Some(limit) = self.limit {
            if counts.total >= limit {
                return Err(Refusal::TotalLimit(limit));
            }
        }
        let from_source = counts.per_source.get(&addr).copied().unwrap_or(0);
        if let Some(limit) = self.limit_per_source {
            if from_source >= limit {
                return Err(Refusal::SourceLimit(limit));
            }
        }
        counts.total += 1;
        counts.per_source.insert(addr, from_source + 1);
        CONNECTIONS_ACTIVE.inc();

        Ok(ConnectionTicket {
            counts: self.counts.clone(),
            addr,
        })
    }

    pub fn active(&self) -> usize {
        self.counts.lock().total
    }

    pub fn active_from(&self, addr: IpAddr) -> usize {
        self.counts
            .lock()
            .per_source
            .get(&addr.to_canonical())
            .copied()
            .unwrap_or(0)
    }
}

/// Proof that a connection has been counted
#[derive(Debug)]
pub struct ConnectionTicket {
    counts: Arc<Mutex<Counts>>,
    addr: IpAddr,
}

impl Drop for ConnectionTicket {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_source.get_mut(&self.addr) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.per_source.remove(&self.addr);
            }
        }
        CONNECTIONS_ACTIVE.dec();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn per_source_ceiling() {
        let accounting = ConnectionAccounting::new(None, Some(2));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        let t1 = accounting.try_admit(a).unwrap();
        let _t2 = accounting.try_admit(a).unwrap();
        assert_equal!(accounting.try_admit(a).err(), Some(Refusal::SourceLimit(2)));
        // IPv4-mapped addresses count against the same source
        assert_equal!(
            accounting
                .try_admit("::ffff:10.0.0.1".parse().unwrap())
                .err(),
            Some(Refusal::SourceLimit(2))
        );
        let _t3 = accounting.try_admit(b).unwrap();
        assert_equal!(accounting.active(), 3);

        drop(t1);
        assert_equal!(accounting.active_from(a), 1);
        let _t4 = accounting.try_admit(a).unwrap();
    }

    #[test]
    fn total_ceiling() {
        let accounting = ConnectionAccounting::new(Some(2), None);
        let tickets: Vec<_> = (1..=2)
            .map(|n| accounting.try_admit(format!("10.0.0.{n}").parse().unwrap()).unwrap())
            .collect();
        let refusal = accounting
            .try_admit("10.0.0.3".parse().unwrap())
            .err()
            .unwrap();
        assert_equal!(refusal.reason(), "connection_limit");
        drop(tickets);
        assert_equal!(accounting.active(), 0);
        assert_equal!(accounting.active_from("10.0.0.1".parse().unwrap()), 0);
    }
}
