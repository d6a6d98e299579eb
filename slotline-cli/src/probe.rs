//! `slotline probe`: fill a pool from one server and report what it kept.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use slotline::{Admission, ClientConfig, Dialer, PoolStats, Slot};

#[derive(Debug, Default, Serialize)]
pub struct ProbeReport {
    pub addr: String,
    pub attempts: usize,
    pub accepted: usize,
    pub replaced: usize,
    pub rejected: usize,
    pub failed: usize,
    pub slots: Vec<Slot>,
    pub pool: Option<PoolStats>,
}

impl ProbeReport {
    fn record(&mut self, admission: &Admission) {
        match admission {
            Admission::Accepted { .. } => self.accepted += 1,
            Admission::Replaced { .. } => self.replaced += 1,
            Admission::Rejected => self.rejected += 1,
        }
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "server:    {}", self.addr)?;
        writeln!(f, "attempts:  {}", self.attempts)?;
        writeln!(
            f,
            "admitted:  {} ({} by replacement)",
            self.accepted + self.replaced,
            self.replaced
        )?;
        writeln!(f, "rejected:  {}", self.rejected)?;
        writeln!(f, "failed:    {}", self.failed)?;
        let slots: Vec<String> = self.slots.iter().map(Slot::to_string).collect();
        writeln!(f, "slots:     [{}]", slots.join(", "))?;
        if let Some(pool) = &self.pool {
            writeln!(f, "pool:      {}/{} held", pool.held, pool.capacity)?;
        }
        Ok(())
    }
}

/// Dial `connections` times and summarise the resulting pool.
///
/// The dialer is returned so the caller decides how long the pooled
/// connections stay open.
pub async fn run(config: ClientConfig, connections: usize) -> anyhow::Result<(ProbeReport, Dialer)> {
    let dialer = Dialer::new(config)?;
    let mut report = ProbeReport {
        addr: dialer.config().addr.clone(),
        ..Default::default()
    };

    for attempt in 0..connections {
        report.attempts += 1;
        match dialer.dial().await {
            Ok(admission) => {
                debug!(attempt, ?admission, "Dialed");
                report.record(&admission);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Dial failed");
                report.failed += 1;
            }
        }
    }

    report.slots = dialer.pool().slots();
    report.pool = Some(dialer.pool().stats());
    Ok((report, dialer))
}
