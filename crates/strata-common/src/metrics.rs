//! Indexer counters and Prometheus text exporter
//!
//! # Prometheus Metrics
//!
//! - `strata_messages_received_total` - Messages handed to the chunk store
//! - `strata_messages_failed_total` - Messages the index refused
//! - `strata_records_received_total` - Records read from the broker
//! - `strata_records_failed_total` - Records that could not become messages
//! - `strata_rollovers_initiated_total` - Chunks sealed for archival
//! - `strata_rollovers_completed_total` - Chunks archived and published
//! - `strata_rollovers_failed_total` - Chunks that could not be archived
//! - `strata_messages_dropped_total{reason}` - Messages refused by admission control
//! - `strata_bytes_dropped_total{reason}` - Bytes refused by admission control

use crate::types::DropReason;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by every component of one indexer process.
#[derive(Debug, Default)]
pub struct IndexerMetrics {
    pub messages_received: Counter,
    pub messages_failed: Counter,
    pub records_received: Counter,
    pub records_failed: Counter,
    pub rollovers_initiated: Counter,
    pub rollovers_completed: Counter,
    pub rollovers_failed: Counter,
    messages_dropped: [Counter; 2],
    bytes_dropped: [Counter; 2],
}

impl IndexerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count refused messages and their bytes under `reason`.
    pub fn record_drop(&self, reason: DropReason, messages: u64, bytes: u64) {
        self.messages_dropped[reason.index()].add(messages);
        self.bytes_dropped[reason.index()].add(bytes);
    }

    #[must_use]
    pub fn messages_dropped(&self, reason: DropReason) -> u64 {
        self.messages_dropped[reason.index()].get()
    }

    #[must_use]
    pub fn bytes_dropped(&self, reason: DropReason) -> u64 {
        self.bytes_dropped[reason.index()].get()
    }

    /// Render all counters in Prometheus text format.
    #[must_use]
    pub fn export_prometheus(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(2048);

        let counters = [
            (
                "messages_received_total",
                "Messages handed to the chunk store",
                &self.messages_received,
            ),
            (
                "messages_failed_total",
                "Messages the index refused",
                &self.messages_failed,
            ),
            (
                "records_received_total",
                "Records read from the broker",
                &self.records_received,
            ),
            (
                "records_failed_total",
                "Records that could not become messages",
                &self.records_failed,
            ),
            (
                "rollovers_initiated_total",
                "Chunks sealed for archival",
                &self.rollovers_initiated,
            ),
            (
                "rollovers_completed_total",
                "Chunks archived and published",
                &self.rollovers_completed,
            ),
            (
                "rollovers_failed_total",
                "Chunks that could not be archived",
                &self.rollovers_failed,
            ),
        ];
        for (name, help, counter) in counters {
            write_header(&mut output, prefix, name, help);
            let _ = writeln!(output, "{prefix}_{name} {}", counter.get());
        }

        write_header(
            &mut output,
            prefix,
            "messages_dropped_total",
            "Messages refused by admission control",
        );
        for reason in DropReason::ALL {
            let _ = writeln!(
                output,
                "{prefix}_messages_dropped_total{{reason=\"{}\"}} {}",
                reason.as_str(),
                self.messages_dropped(reason)
            );
        }

        write_header(
            &mut output,
            prefix,
            "bytes_dropped_total",
            "Bytes refused by admission control",
        );
        for reason in DropReason::ALL {
            let _ = writeln!(
                output,
                "{prefix}_bytes_dropped_total{{reason=\"{}\"}} {}",
                reason.as_str(),
                self.bytes_dropped(reason)
            );
        }

        output
    }
}

fn write_header(output: &mut String, prefix: &str, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {prefix}_{name} {help}");
    let _ = writeln!(output, "# TYPE {prefix}_{name} counter");
}
