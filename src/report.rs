//! End-of-run summary of the filter counters.

use crate::engine::FilterStats;
use std::fmt::Write;

/// `part` as a percentage of `whole`; zero when `whole` is zero
pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

/// Human readable summary, one counter per line. Preliminary filters are
/// relative to all reads; contamination counters to the considered reads.
pub fn summary(stats: &FilterStats, sources: &[String]) -> String {
    let mut out = String::new();
    let reads = stats.total_reads;
    let line = |out: &mut String, label: &str, count: u64, whole: u64| {
        let _ = writeln!(
            out,
            "{:<16}{:>12} ({:.2}%)",
            label,
            count,
            percent(count, whole)
        );
    };

    let _ = writeln!(out, "{:<16}{:>12}", "Reads:", reads);
    let _ = writeln!(out, "{:<16}{:>12}", "Mates:", stats.total_mates);
    line(&mut out, "ERCC:", stats.ercc_filtered, reads);
    line(&mut out, "Too short:", stats.too_short, reads);
    line(&mut out, "Too diverged:", stats.too_diverged, reads);
    line(&mut out, "Considered:", stats.considered, reads);
    line(&mut out, "Kept:", stats.kept, stats.considered);
    line(&mut out, "Mates kept:", stats.mates_kept, stats.total_mates);

    for (index, name) in sources.iter().enumerate() {
        let found = stats.found.get(index).copied().unwrap_or(0);
        let rejected = stats.rejected.get(index).copied().unwrap_or(0);
        let _ = writeln!(
            out,
            "{}: found {} ({:.2}%), rejected {} ({:.2}%)",
            name,
            found,
            percent(found, stats.considered),
            rejected,
            percent(rejected, stats.considered)
        );
    }
    out
}
