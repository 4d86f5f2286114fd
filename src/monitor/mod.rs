//! Background monitors: data consistency (reconciliation and repair) and
//! query performance (histograms, slow-query log, threshold alerts).

mod consistency;
mod performance;

pub use consistency::{
    CheckKind, CheckReport, ConsistencyMonitor, RepairOutcome, Severity,
};
pub use performance::{OpSnapshot, PerfMonitor};
