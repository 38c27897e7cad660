//! Matching and scoring of sample reads against contamination alignments.
//!
//! The sample stream and every contamination stream are sorted by read name,
//! so the engine walks them together as a merge join: each turn takes the next
//! sample read (and its mate, which directly follows it), applies the
//! preliminary filters, then drains every alignment of that read from each
//! contamination stream. A read is kept only when no contamination source
//! explains it at least as well as the sample reference does.

use crate::config::FilterConfig;
use crate::cursor::SortedCursor;
use crate::error::FilterError;
use crate::record::{AlignmentRecord, ScoredAlignment};
use crate::sink::RecordSink;
use log::{debug, error, info};
use rustc_hash::FxHashSet;
use std::io::Write;

/// Counters accumulated over a whole run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterStats {
    pub total_reads: u64,
    pub total_mates: u64,
    pub ercc_filtered: u64,
    pub too_short: u64,
    pub too_diverged: u64,
    pub considered: u64,
    pub kept: u64,
    pub mates_kept: u64,
    /// Reads with at least one alignment in each contamination source
    pub found: Vec<u64>,
    /// Reads rejected by each contamination source
    pub rejected: Vec<u64>,
}

impl FilterStats {
    pub fn new(sources: usize) -> Self {
        FilterStats {
            found: vec![0; sources],
            rejected: vec![0; sources],
            ..Default::default()
        }
    }
}

/// Outcome of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Kept,
    Contaminated,
    TooShort,
    TooDiverged,
    Ercc,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Kept => "kept",
            Decision::Contaminated => "contaminated",
            Decision::TooShort => "too_short",
            Decision::TooDiverged => "too_diverged",
            Decision::Ercc => "ercc",
        }
    }
}

/// One sample record with the values it is filtered and scored on
#[derive(Debug)]
struct Mate {
    record: AlignmentRecord,
    alignment: ScoredAlignment,
}

/// Keep the mates passing `passes`. A failing first mate is replaced by a
/// passing second mate; `None` when neither passes.
fn retain_mates(
    mate1: Mate,
    mate2: Option<Mate>,
    passes: impl Fn(&Mate) -> bool,
) -> Option<(Mate, Option<Mate>)> {
    let mate2 = mate2.filter(|mate| passes(mate));
    if passes(&mate1) {
        Some((mate1, mate2))
    } else {
        mate2.map(|mate| (mate, None))
    }
}

/// Per-turn detail of the contamination comparison
#[derive(Debug, Default)]
struct Comparison {
    matched_by: FxHashSet<usize>,
    rejected_by: FxHashSet<usize>,
}

/// The matching and scoring engine.
pub struct ContaminationFilter {
    config: FilterConfig,
    sample: SortedCursor,
    contaminants: Vec<SortedCursor>,
    stats: FilterStats,
    read_log: Option<Box<dyn Write>>,
}

impl ContaminationFilter {
    pub fn new(config: FilterConfig, sample: SortedCursor, contaminants: Vec<SortedCursor>) -> Self {
        let stats = FilterStats::new(contaminants.len());
        ContaminationFilter {
            config,
            sample,
            contaminants,
            stats,
            read_log: None,
        }
    }

    /// Record one line per sample read describing what happened to it
    pub fn with_read_log(mut self, read_log: Box<dyn Write>) -> Self {
        self.read_log = Some(read_log);
        self
    }

    /// Names of the contamination sources, in configuration order
    pub fn source_names(&self) -> Vec<String> {
        self.contaminants
            .iter()
            .map(|cursor| cursor.source().to_string())
            .collect()
    }

    /// Process sample reads until the stream ends or the read limit is hit
    pub fn run<W: Write>(&mut self, sink: &mut RecordSink<W>) -> Result<(), FilterError> {
        info!(
            "Filtering '{}' against {} contamination source(s)",
            self.sample.source(),
            self.contaminants.len()
        );
        while self
            .config
            .limit
            .map_or(true, |limit| self.stats.total_reads < limit)
        {
            if !self.turn(sink)? {
                break;
            }
        }
        if let Some(limit) = self.config.limit {
            if self.stats.total_reads >= limit {
                info!("Stopped after the read limit of {}", limit);
            }
        }
        if let Some(read_log) = self.read_log.as_mut() {
            read_log.flush()?;
        }
        Ok(())
    }

    fn mate(&self, record: AlignmentRecord, source: &str) -> Result<Mate, FilterError> {
        let (length, distance) = record
            .length_and_distance(&self.config.distance_tag)
            .map_err(|reason| FilterError::MalformedRecord {
                source: source.to_string(),
                read: record.read_id().to_string(),
                reason,
            })?;
        Ok(Mate {
            alignment: ScoredAlignment::new(length, distance, self.config.penalty),
            record,
        })
    }

    /// Process one sample read. Returns `false` once the sample is exhausted.
    pub fn turn<W: Write>(&mut self, sink: &mut RecordSink<W>) -> Result<bool, FilterError> {
        let Some(first) = self.sample.next_record()? else {
            return Ok(false);
        };
        let read_id = first.read_id().to_string();
        self.stats.total_reads += 1;
        self.stats.total_mates += 1;

        let second = self.sample.find_by_identifier(&read_id)?;
        if second.is_some() {
            self.stats.total_mates += 1;
        }

        let source = self.sample.source().to_string();
        let mate1 = self.mate(first, &source)?;
        let mate2 = second.map(|record| self.mate(record, &source)).transpose()?;

        if self.config.exclude_ercc
            && (mate1.record.is_ercc() || mate2.as_ref().is_some_and(|m| m.record.is_ercc()))
        {
            self.stats.ercc_filtered += 1;
            return self.finish_turn(&read_id, Decision::Ercc, None, &Comparison::default());
        }

        let min_length = self.config.min_length;
        let Some((mate1, mate2)) =
            retain_mates(mate1, mate2, |m| m.alignment.length >= min_length)
        else {
            self.stats.too_short += 1;
            return self.finish_turn(&read_id, Decision::TooShort, None, &Comparison::default());
        };

        let max_distance = self.config.max_distance;
        let Some((mate1, mate2)) =
            retain_mates(mate1, mate2, |m| m.alignment.edit_distance <= max_distance)
        else {
            self.stats.too_diverged += 1;
            return self.finish_turn(&read_id, Decision::TooDiverged, None, &Comparison::default());
        };

        self.stats.considered += 1;

        let best = match &mate2 {
            Some(mate2) if mate2.alignment.score > mate1.alignment.score => mate2.alignment,
            _ => mate1.alignment,
        };

        let comparison = self.compare_contaminants(&read_id, &best)?;
        if !comparison.rejected_by.is_empty() {
            return self.finish_turn(&read_id, Decision::Contaminated, Some(&best), &comparison);
        }

        sink.write_record(&mate1.record)?;
        self.stats.kept += 1;
        self.stats.mates_kept += 1;
        if let Some(mate2) = &mate2 {
            sink.write_record(&mate2.record)?;
            self.stats.mates_kept += 1;
        }
        self.finish_turn(&read_id, Decision::Kept, Some(&best), &comparison)
    }

    /// Drain every alignment of `read_id` from each contamination source and
    /// test it against the sample's best alignment. All sources are
    /// consulted so the per-source counters stay complete.
    fn compare_contaminants(
        &mut self,
        read_id: &str,
        best: &ScoredAlignment,
    ) -> Result<Comparison, FilterError> {
        let mut comparison = Comparison::default();
        let tag = self.config.distance_tag.as_str();

        for (index, cursor) in self.contaminants.iter_mut().enumerate() {
            while let Some(hit) = cursor.find_by_identifier(read_id)? {
                if comparison.matched_by.insert(index) {
                    self.stats.found[index] += 1;
                }
                let (length, distance) =
                    hit.length_and_distance(tag)
                        .map_err(|reason| FilterError::MalformedRecord {
                            source: cursor.source().to_string(),
                            read: read_id.to_string(),
                            reason,
                        })?;
                if length < self.config.min_length {
                    continue;
                }
                let contamination = ScoredAlignment::new(length, distance, self.config.penalty);
                if best.score <= contamination.score + self.config.margin
                    && comparison.rejected_by.insert(index)
                {
                    self.stats.rejected[index] += 1;
                    debug!(
                        "{}: sample score {} <= {} + {} in '{}'",
                        read_id,
                        best.score,
                        contamination.score,
                        self.config.margin,
                        cursor.source()
                    );
                }
            }
        }

        Ok(comparison)
    }

    fn finish_turn(
        &mut self,
        read_id: &str,
        decision: Decision,
        best: Option<&ScoredAlignment>,
        comparison: &Comparison,
    ) -> Result<bool, FilterError> {
        debug!("{}: {}", read_id, decision.as_str());
        let Some(read_log) = self.read_log.as_mut() else {
            return Ok(true);
        };

        let names = |indices: &FxHashSet<usize>| {
            let mut indices: Vec<usize> = indices.iter().copied().collect();
            indices.sort_unstable();
            if indices.is_empty() {
                return ".".to_string();
            }
            indices
                .iter()
                .map(|&i| self.contaminants[i].source())
                .collect::<Vec<_>>()
                .join(",")
        };
        let score = best.map_or_else(|| ".".to_string(), |b| b.score.to_string());
        writeln!(
            read_log,
            "{}\t{}\t{}\t{}\t{}",
            read_id,
            decision.as_str(),
            score,
            names(&comparison.matched_by),
            names(&comparison.rejected_by)
        )?;
        Ok(true)
    }

    /// Close every source, joining their decoders, and hand back the counters.
    /// All sources are closed even when one of them fails.
    pub fn close(self) -> Result<FilterStats, FilterError> {
        let ContaminationFilter {
            sample,
            contaminants,
            stats,
            read_log,
            ..
        } = self;
        drop(read_log);

        let mut first_error = None;
        for cursor in std::iter::once(sample).chain(contaminants) {
            let source = cursor.source().to_string();
            if let Err(e) = cursor.close() {
                error!("Closing '{}' failed: {}", source, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sam_line;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn cursor(name: &str, lines: &[String]) -> SortedCursor {
        let text: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        SortedCursor::from_reader(name, Cursor::new(text), "nM").unwrap()
    }

    fn scenario_config() -> FilterConfig {
        FilterConfig {
            min_length: 60,
            max_distance: 5,
            penalty: 2.0,
            margin: 1.0,
            ..Default::default()
        }
    }

    fn run(
        config: FilterConfig,
        sample: &[String],
        contaminants: &[&[String]],
    ) -> (Vec<String>, FilterStats) {
        let sources = contaminants
            .iter()
            .enumerate()
            .map(|(i, lines)| cursor(&format!("cont{}", i + 1), lines))
            .collect();
        let mut engine = ContaminationFilter::new(config, cursor("sample", sample), sources);
        let mut sink = RecordSink::new("memory", Vec::new());
        engine.run(&mut sink).unwrap();
        let stats = engine.close().unwrap();
        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        (output.lines().map(str::to_string).collect(), stats)
    }

    /// A `Write` whose contents stay readable after being boxed
    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_paired_read_rejected_single_read_kept() {
        let sample = vec![
            sam_line("R1", "chr1", 80, 1),
            sam_line("R1", "chr1", 80, 1),
            sam_line("R2", "chr1", 60, 0),
        ];
        let contamination = vec![sam_line("R1", "phiX", 90, 0)];
        let (output, stats) = run(scenario_config(), &sample, &[&contamination]);

        assert_eq!(output, vec![sam_line("R2", "chr1", 60, 0)]);
        assert_eq!(stats.total_reads, 2);
        assert_eq!(stats.total_mates, 3);
        assert_eq!(stats.considered, 2);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.mates_kept, 1);
        assert_eq!(stats.found, vec![1]);
        assert_eq!(stats.rejected, vec![1]);
    }

    #[test]
    fn test_short_mate1_is_replaced_by_mate2() {
        let mate1 = sam_line("R1", "chr1", 40, 0);
        let mate2 = sam_line("R1", "chr1", 70, 2);
        // Scores 60 against mate2's 66: only the short mate1 would be rejected
        let contamination = vec![sam_line("R1", "phiX", 60, 0)];
        let (output, stats) = run(scenario_config(), &[mate1, mate2.clone()], &[&contamination]);
        assert_eq!(output, vec![mate2]);
        assert_eq!(stats.total_mates, 2);
        assert_eq!(stats.too_short, 0);
        assert_eq!(stats.considered, 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.mates_kept, 1);
        assert_eq!(stats.found, vec![1]);
        assert_eq!(stats.rejected, vec![0]);
    }

    #[test]
    fn test_short_mate2_is_dropped() {
        let mate1 = sam_line("R1", "chr1", 70, 0);
        let mate2 = sam_line("R1", "chr1", 30, 0);
        let (output, stats) = run(scenario_config(), &[mate1.clone(), mate2], &[&[]]);
        assert_eq!(output, vec![mate1]);
        assert_eq!(stats.total_mates, 2);
        assert_eq!(stats.mates_kept, 1);
    }

    #[test]
    fn test_both_mates_too_short() {
        let sample = vec![sam_line("R1", "chr1", 30, 0), sam_line("R1", "chr1", 59, 0)];
        let contamination = vec![sam_line("R1", "phiX", 90, 0)];
        let (output, stats) = run(scenario_config(), &sample, &[&contamination]);
        assert!(output.is_empty());
        assert_eq!(stats.too_short, 1);
        assert_eq!(stats.considered, 0);
        // Filtered reads never reach the contamination comparison
        assert_eq!(stats.found, vec![0]);
    }

    #[test]
    fn test_edit_distance_filter_with_promotion() {
        let diverged = sam_line("R1", "chr1", 80, 6);
        let close = sam_line("R1", "chr1", 80, 5);
        let (output, stats) = run(scenario_config(), &[diverged.clone(), close.clone()], &[&[]]);
        assert_eq!(output, vec![close]);
        assert_eq!(stats.too_diverged, 0);

        let (output, stats) = run(
            scenario_config(),
            &[diverged.clone(), sam_line("R1", "chr1", 80, 9)],
            &[&[]],
        );
        assert!(output.is_empty());
        assert_eq!(stats.too_diverged, 1);
        assert_eq!(stats.considered, 0);
    }

    #[test]
    fn test_length_filter_runs_before_distance_filter() {
        // mate1 is long but diverged, mate2 is short but exact: nothing survives both
        let sample = vec![sam_line("R1", "chr1", 80, 9), sam_line("R1", "chr1", 40, 0)];
        let (_, stats) = run(scenario_config(), &sample, &[&[]]);
        assert_eq!(stats.too_short, 0);
        assert_eq!(stats.too_diverged, 1);
    }

    #[test]
    fn test_best_mate_is_the_basis() {
        // Scores 80 and 70; a contamination score of 75 must not reject the pair
        let sample = vec![sam_line("R1", "chr1", 70, 0), sam_line("R1", "chr1", 80, 0)];
        let contamination = vec![sam_line("R1", "phiX", 75, 0)];
        let (output, stats) = run(scenario_config(), &sample, &[&contamination]);
        assert_eq!(output.len(), 2);
        assert_eq!(stats.mates_kept, 2);
        assert_eq!(stats.found, vec![1]);
        assert_eq!(stats.rejected, vec![0]);
    }

    #[test]
    fn test_margin_rejects_ties_and_near_ties() {
        let sample = vec![sam_line("R1", "chr1", 80, 0)];
        // 80 <= 79 + 1
        let (output, _) = run(scenario_config(), &sample, &[&[sam_line("R1", "phiX", 79, 0)]]);
        assert!(output.is_empty());
        // 80 > 78 + 1
        let (output, _) = run(scenario_config(), &sample, &[&[sam_line("R1", "phiX", 78, 0)]]);
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn test_short_contamination_alignment_is_found_but_not_scored() {
        let sample = vec![sam_line("R1", "chr1", 60, 5)];
        let contamination = vec![sam_line("R1", "phiX", 59, 0)];
        let (output, stats) = run(scenario_config(), &sample, &[&contamination]);
        assert_eq!(output.len(), 1);
        assert_eq!(stats.found, vec![1]);
        assert_eq!(stats.rejected, vec![0]);
    }

    #[test]
    fn test_every_source_is_consulted() {
        let sample = vec![sam_line("R1", "chr1", 80, 0), sam_line("R2", "chr1", 80, 0)];
        let first = vec![
            sam_line("R1", "phiX", 90, 0),
            sam_line("R1", "phiX", 95, 0),
            sam_line("R2", "phiX", 10, 0),
        ];
        let second = vec![sam_line("R1", "ecoli", 85, 0), sam_line("R2", "ecoli", 60, 0)];
        let (output, stats) = run(scenario_config(), &sample, &[&first, &second]);
        assert_eq!(output, vec![sam_line("R2", "chr1", 80, 0)]);
        assert_eq!(stats.found, vec![2, 2]);
        // Two rejecting alignments in one source count once
        assert_eq!(stats.rejected, vec![1, 1]);
    }

    #[test]
    fn test_contamination_streams_skip_unrelated_reads() {
        let sample = vec![sam_line("r2", "chr1", 80, 0), sam_line("r10", "chr1", 80, 0)];
        let contamination = vec![
            sam_line("r1", "phiX", 90, 0),
            sam_line("r3", "phiX", 90, 0),
            sam_line("r9", "phiX", 90, 0),
            sam_line("r10", "phiX", 90, 0),
            sam_line("r11", "phiX", 90, 0),
        ];
        let (output, stats) = run(scenario_config(), &sample, &[&contamination]);
        assert_eq!(output, vec![sam_line("r2", "chr1", 80, 0)]);
        assert_eq!(stats.found, vec![1]);
        assert_eq!(stats.rejected, vec![1]);
    }

    #[test]
    fn test_ercc_exclusion() {
        let sample = vec![
            sam_line("R1", "chr1", 80, 0),
            sam_line("R1", "ERCC-00130", 80, 0),
            sam_line("R2", "chr1", 80, 0),
        ];
        let config = FilterConfig {
            exclude_ercc: true,
            ..scenario_config()
        };
        let (output, stats) = run(config, &sample, &[&[]]);
        assert_eq!(output, vec![sam_line("R2", "chr1", 80, 0)]);
        assert_eq!(stats.ercc_filtered, 1);
        assert_eq!(stats.considered, 1);

        // Without the switch ERCC reads are treated like any other
        let (output, stats) = run(scenario_config(), &sample, &[&[]]);
        assert_eq!(output.len(), 3);
        assert_eq!(stats.ercc_filtered, 0);
    }

    #[test]
    fn test_limit_stops_after_exact_number_of_turns() {
        let sample: Vec<String> = (1..=8)
            .map(|i| sam_line(&format!("read{}", i), "chr1", 80, 0))
            .collect();
        let config = FilterConfig {
            limit: Some(5),
            ..scenario_config()
        };
        let (output, stats) = run(config, &sample, &[&[]]);
        assert_eq!(stats.total_reads, 5);
        assert_eq!(output.len(), 5);
        assert_eq!(output[4], sam_line("read5", "chr1", 80, 0));
    }

    #[test]
    fn test_malformed_contamination_record_is_fatal() {
        let sample = vec![sam_line("R1", "chr1", 80, 0)];
        let contamination = vec!["R1\t0\tphiX".to_string()];
        let mut engine = ContaminationFilter::new(
            scenario_config(),
            cursor("sample", &sample),
            vec![cursor("cont", &contamination)],
        );
        let mut sink = RecordSink::new("memory", Vec::new());
        assert!(matches!(
            engine.run(&mut sink),
            Err(FilterError::Scan { .. })
        ));
    }

    #[test]
    fn test_unsorted_sample_is_fatal() {
        let sample = vec![sam_line("R2", "chr1", 80, 0), sam_line("R1", "chr1", 80, 0)];
        let mut engine =
            ContaminationFilter::new(scenario_config(), cursor("sample", &sample), vec![]);
        let mut sink = RecordSink::new("memory", Vec::new());
        assert!(engine.turn(&mut sink).is_err());
    }

    #[test]
    fn test_read_log() {
        let sample = vec![
            sam_line("R1", "chr1", 80, 1),
            sam_line("R2", "chr1", 30, 0),
            sam_line("R3", "chr1", 80, 0),
        ];
        let contamination = vec![sam_line("R1", "phiX", 90, 0), sam_line("R3", "phiX", 10, 0)];
        let log = SharedBuffer::default();
        let mut engine = ContaminationFilter::new(
            scenario_config(),
            cursor("sample", &sample),
            vec![cursor("cont1", &contamination)],
        )
        .with_read_log(Box::new(log.clone()));
        let mut sink = RecordSink::new("memory", Vec::new());
        engine.run(&mut sink).unwrap();
        engine.close().unwrap();

        let text = String::from_utf8(log.0.borrow().clone()).unwrap();
        assert_eq!(
            text,
            "R1\tcontaminated\t78\tcont1\tcont1\nR2\ttoo_short\t.\t.\t.\nR3\tkept\t80\tcont1\t.\n"
        );
    }
}
