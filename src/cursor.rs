//! Forward-only cursor over a name-sorted stream of SAM records.
//!
//! Records are scanned lazily, one line at a time, and validated as they are
//! read: every record must carry the fields the engine scores on, and read
//! names must never decrease in natural order. A one-record lookahead lets
//! callers inspect the next record without consuming it, which is what
//! [`SortedCursor::find_by_identifier`] needs to run a streaming merge join.

use crate::error::FilterError;
use crate::natural;
use crate::process::{ExternalProcess, Samtools};
use crate::record::AlignmentRecord;
use log::{debug, info};
use std::cmp::Ordering;
use std::io::{self, BufRead, BufReader};
use std::iter::{Fuse, Peekable};
use std::path::Path;

/// Lazy sequence of validated records read line by line
struct ScannedRecords {
    source: String,
    reader: Box<dyn BufRead>,
    line_number: usize,
    previous: Option<String>,
    distance_tag: String,
    line: String,
}

impl ScannedRecords {
    fn scan_error(&self, reason: String) -> FilterError {
        FilterError::Scan {
            source: self.source.clone(),
            line: self.line_number,
            reason,
        }
    }
}

impl Iterator for ScannedRecords {
    type Item = Result<AlignmentRecord, FilterError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                return Some(Err(self.scan_error(format!("read failed: {}", e))));
            }
        }
        self.line_number += 1;

        let Some(record) = AlignmentRecord::from_line(&self.line) else {
            return Some(Err(self.scan_error("empty record".to_string())));
        };
        if let Err(reason) = record.length_and_distance(&self.distance_tag) {
            return Some(Err(self.scan_error(reason)));
        }
        if let Some(previous) = &self.previous {
            if natural::compare(previous, record.read_id()) == Ordering::Greater {
                return Some(Err(self.scan_error(format!(
                    "sorting order violated: '{}' follows '{}'",
                    record.read_id(),
                    previous
                ))));
            }
        }
        self.previous = Some(record.read_id().to_string());

        Some(Ok(record))
    }
}

/// Consume the leading `@` lines of a SAM stream, returning them verbatim
fn read_header_lines<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<(String, usize)> {
    let mut header = String::new();
    let mut lines = 0;
    while reader.fill_buf()?.first() == Some(&b'@') {
        reader.read_line(&mut header)?;
        lines += 1;
    }
    Ok((header, lines))
}

/// A name-sorted record source with single-record lookahead.
pub struct SortedCursor {
    source: String,
    header: String,
    records: Peekable<Fuse<ScannedRecords>>,
    decoder: Option<ExternalProcess>,
    exhausted: bool,
}

impl SortedCursor {
    /// Decode `bam` with an external `samtools view` process
    pub fn open(bam: &Path, samtools: &Samtools, distance_tag: &str) -> Result<Self, FilterError> {
        let source = bam.display().to_string();
        std::fs::metadata(bam).map_err(|e| FilterError::Open {
            source: source.clone(),
            reason: e.to_string(),
        })?;

        let header = samtools.read_header(bam)?;
        let (decoder, stdout) = samtools.decode(bam)?;
        info!("Reading '{}' through '{}'", source, decoder.name());

        let mut cursor =
            Self::with_header(source, header, Box::new(BufReader::new(stdout)), 0, distance_tag);
        cursor.decoder = Some(decoder);
        Ok(cursor)
    }

    /// Read already decoded SAM text from standard input
    pub fn from_stdin(distance_tag: &str) -> Result<Self, FilterError> {
        Self::from_reader("stdin", io::stdin().lock(), distance_tag)
    }

    /// Read already decoded SAM text; leading `@` lines become the header
    pub fn from_reader(
        source: &str,
        reader: impl BufRead + 'static,
        distance_tag: &str,
    ) -> Result<Self, FilterError> {
        let mut reader: Box<dyn BufRead> = Box::new(reader);
        let (header, header_lines) =
            read_header_lines(&mut reader).map_err(|e| FilterError::Open {
                source: source.to_string(),
                reason: e.to_string(),
            })?;
        if header_lines > 0 {
            debug!("Read {} header lines from '{}'", header_lines, source);
        }
        Ok(Self::with_header(
            source.to_string(),
            header,
            reader,
            header_lines,
            distance_tag,
        ))
    }

    fn with_header(
        source: String,
        header: String,
        reader: Box<dyn BufRead>,
        line_number: usize,
        distance_tag: &str,
    ) -> Self {
        let records = ScannedRecords {
            source: source.clone(),
            reader,
            line_number,
            previous: None,
            distance_tag: distance_tag.to_string(),
            line: String::new(),
        };
        SortedCursor {
            source,
            header,
            records: records.fuse().peekable(),
            decoder: None,
            exhausted: false,
        }
    }

    /// Name of the underlying file (or `stdin`)
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Header text of the source, possibly empty
    pub fn header(&self) -> &str {
        &self.header
    }

    /// The next record, without consuming it. `None` once the stream ends.
    pub fn peek(&mut self) -> Result<Option<&AlignmentRecord>, FilterError> {
        if self.exhausted {
            return Ok(None);
        }
        let failed = matches!(self.records.peek(), Some(Err(_)));
        if failed {
            if let Some(Err(e)) = self.records.next() {
                return Err(e);
            }
        }
        if self.records.peek().is_none() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(self.records.peek().and_then(|record| record.as_ref().ok()))
    }

    /// Discard the record returned by the last `peek`
    pub fn advance(&mut self) {
        if matches!(self.records.peek(), Some(Ok(_))) {
            self.records.next();
        }
    }

    /// Consume and return the next record
    pub fn next_record(&mut self) -> Result<Option<AlignmentRecord>, FilterError> {
        if self.peek()?.is_none() {
            return Ok(None);
        }
        Ok(self.records.next().and_then(Result::ok))
    }

    /// Skip forward to the next record named `id` and consume it.
    ///
    /// Records named before `id` are discarded. Returns `None` without
    /// consuming anything once the next record is named after `id`, so a
    /// later call for that name still finds it.
    ///
    /// Names that differ only in zero padding (`r02` and `r2`) sort as equal
    /// but never match. Such a record also stops the search, so a stream
    /// holding `r02` then `r3` answers `None` for `r2` and still yields `r02`
    /// afterwards. Every input is expected to come from the same name sort,
    /// which keeps such names in the same relative order in all streams.
    pub fn find_by_identifier(&mut self, id: &str) -> Result<Option<AlignmentRecord>, FilterError> {
        loop {
            let ordering = match self.peek()? {
                None => return Ok(None),
                Some(record) if record.read_id() == id => Ordering::Equal,
                Some(record) => match natural::compare(record.read_id(), id) {
                    // Same number with different zero padding is not a match
                    Ordering::Equal => Ordering::Greater,
                    ordering => ordering,
                },
            };
            match ordering {
                Ordering::Less => self.advance(),
                Ordering::Equal => return self.next_record(),
                Ordering::Greater => return Ok(None),
            }
        }
    }

    /// Release the source, joining its decoder. A decoder still running when
    /// its output is abandoned may die of SIGPIPE; that is not reported, any
    /// other failure is.
    pub fn close(self) -> Result<(), FilterError> {
        let SortedCursor {
            records,
            decoder,
            exhausted,
            ..
        } = self;
        let Some(mut decoder) = decoder else {
            return Ok(());
        };
        // Checked before hanging up: a decoder that already exited was not
        // stopped by us, whatever its status
        let finished = exhausted || decoder.is_done();
        drop(records);
        if finished {
            decoder.join()
        } else {
            decoder.join_after_hangup()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sam_line;
    use std::io::Cursor;

    fn cursor_over(lines: &[String]) -> SortedCursor {
        let mut text = lines.join("\n");
        text.push('\n');
        SortedCursor::from_reader("test", Cursor::new(text), "nM").unwrap()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| sam_line(n, "chr1", 10, 0)).collect()
    }

    #[test]
    fn test_peek_and_advance() {
        let mut cursor = cursor_over(&ids(&["r1", "r2"]));
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r1");
        // Peeking twice does not consume
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r1");
        cursor.advance();
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r2");
        cursor.advance();
        assert!(cursor.peek().unwrap().is_none());
        assert!(cursor.exhausted);
        assert!(cursor.peek().unwrap().is_none());
        assert!(cursor.next_record().unwrap().is_none());
    }

    #[test]
    fn test_header_lines_are_captured() {
        let text = format!(
            "@HD\tVN:1.6\tSO:queryname\n@SQ\tSN:chr1\tLN:1000\n{}\n",
            sam_line("r1", "chr1", 10, 0)
        );
        let mut cursor = SortedCursor::from_reader("test", Cursor::new(text), "nM").unwrap();
        assert_eq!(
            cursor.header(),
            "@HD\tVN:1.6\tSO:queryname\n@SQ\tSN:chr1\tLN:1000\n"
        );
        assert_eq!(cursor.next_record().unwrap().unwrap().read_id(), "r1");
    }

    #[test]
    fn test_find_by_identifier_skips_earlier_reads() {
        let mut cursor = cursor_over(&ids(&["r1", "r2", "r2", "r5", "r10"]));
        let found = cursor.find_by_identifier("r2").unwrap().unwrap();
        assert_eq!(found.read_id(), "r2");
        let found = cursor.find_by_identifier("r2").unwrap().unwrap();
        assert_eq!(found.read_id(), "r2");
        assert!(cursor.find_by_identifier("r2").unwrap().is_none());
        // r5 is left in place for a later query
        assert!(cursor.find_by_identifier("r3").unwrap().is_none());
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r5");
        assert_eq!(
            cursor.find_by_identifier("r10").unwrap().unwrap().read_id(),
            "r10"
        );
        assert!(cursor.find_by_identifier("r11").unwrap().is_none());
        assert!(cursor.exhausted);
    }

    #[test]
    fn test_find_never_yields_passed_records() {
        let mut cursor = cursor_over(&ids(&["a1", "a3", "a5"]));
        assert!(cursor.find_by_identifier("a4").unwrap().is_none());
        // Every identifier at or before a4 has been passed
        for id in ["a1", "a2", "a3", "a4"] {
            assert!(cursor.find_by_identifier(id).unwrap().is_none(), "{id}");
        }
        assert_eq!(cursor.find_by_identifier("a5").unwrap().unwrap().read_id(), "a5");
    }

    #[test]
    fn test_zero_padded_name_is_not_a_match() {
        let mut cursor = cursor_over(&ids(&["r02", "r3"]));
        assert!(cursor.find_by_identifier("r2").unwrap().is_none());
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r02");
        let found = cursor.find_by_identifier("r02").unwrap().unwrap();
        assert_eq!(found.read_id(), "r02");
        assert_eq!(cursor.peek().unwrap().unwrap().read_id(), "r3");
    }

    #[test]
    fn test_order_violation() {
        let mut cursor = cursor_over(&ids(&["r1", "r10", "r9"]));
        cursor.advance();
        cursor.advance();
        match cursor.peek() {
            Err(FilterError::Scan { line, reason, .. }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("sorting order violated"));
            }
            other => panic!("expected scan error, got {:?}", other.map(|r| r.cloned())),
        }
    }

    #[test]
    fn test_natural_order_is_accepted() {
        let mut cursor = cursor_over(&ids(&["r2", "r9", "r10", "r010", "r11"]));
        let mut seen = Vec::new();
        while let Some(record) = cursor.next_record().unwrap() {
            seen.push(record.read_id().to_string());
        }
        assert_eq!(seen, vec!["r2", "r9", "r10", "r010", "r11"]);
    }

    #[test]
    fn test_malformed_lines() {
        let text = format!("{}\n\n", sam_line("r1", "chr1", 10, 0));
        let mut cursor = SortedCursor::from_reader("test", Cursor::new(text), "nM").unwrap();
        cursor.advance();
        assert!(matches!(cursor.peek(), Err(FilterError::Scan { line: 2, .. })));

        let mut cursor = cursor_over(&["r1\t0\tchr1".to_string()]);
        assert!(matches!(cursor.peek(), Err(FilterError::Scan { line: 1, .. })));

        let bad_tag = sam_line("r1", "chr1", 10, 0).replace("nM:i:0", "nM:i:-");
        let mut cursor = cursor_over(&[bad_tag]);
        assert!(matches!(cursor.find_by_identifier("r1"), Err(FilterError::Scan { .. })));
    }

    #[test]
    fn test_line_numbers_count_header() {
        let text = format!("@HD\tVN:1.6\n{}\n", "r1\tbroken");
        let mut cursor = SortedCursor::from_reader("test", Cursor::new(text), "nM").unwrap();
        assert!(matches!(cursor.peek(), Err(FilterError::Scan { line: 2, .. })));
    }

    #[test]
    fn test_open_missing_file() {
        let result = SortedCursor::open(
            Path::new("/nonexistent/sample.bam"),
            &Samtools::default(),
            "nM",
        );
        assert!(matches!(result, Err(FilterError::Open { .. })));
    }

    #[test]
    fn test_close_without_decoder() {
        let cursor = cursor_over(&ids(&["r1"]));
        cursor.close().unwrap();
    }
}
