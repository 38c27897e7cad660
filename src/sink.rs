//! Output of surviving records, normally into a `samtools` encoder.

use crate::error::FilterError;
use crate::process::{ExternalProcess, Samtools};
use crate::record::AlignmentRecord;
use log::info;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ChildStdin;

/// Writes a header followed by records as SAM text lines.
pub struct RecordSink<W: Write> {
    destination: String,
    writer: BufWriter<W>,
    encoder: Option<ExternalProcess>,
    records_written: u64,
}

impl RecordSink<ChildStdin> {
    /// Start a `samtools` encoder writing the BAM file `bam`
    pub fn open(bam: &Path, samtools: &Samtools) -> Result<Self, FilterError> {
        let (encoder, stdin) = samtools.encode(bam)?;
        info!("Writing '{}' through '{}'", bam.display(), encoder.name());
        let mut sink = RecordSink::new(&bam.display().to_string(), stdin);
        sink.encoder = Some(encoder);
        Ok(sink)
    }
}

impl<W: Write> RecordSink<W> {
    pub fn new(destination: &str, writer: W) -> Self {
        RecordSink {
            destination: destination.to_string(),
            writer: BufWriter::new(writer),
            encoder: None,
            records_written: 0,
        }
    }

    /// An encoder that stopped reading usually explains why the write failed
    fn write_failed(&mut self, e: io::Error) -> FilterError {
        match self.encoder.take() {
            Some(encoder) => match encoder.join() {
                Err(encoder_error) => encoder_error,
                Ok(()) => FilterError::Io(e),
            },
            None => FilterError::Io(e),
        }
    }

    /// Write the header block. Must precede every record.
    pub fn write_header(&mut self, header: &str) -> Result<(), FilterError> {
        if self.records_written > 0 {
            return Err(FilterError::Io(io::Error::other(format!(
                "header written to '{}' after {} records",
                self.destination, self.records_written
            ))));
        }
        let mut result = self.writer.write_all(header.as_bytes());
        if result.is_ok() && !header.is_empty() && !header.ends_with('\n') {
            result = self.writer.write_all(b"\n");
        }
        result.map_err(|e| self.write_failed(e))
    }

    /// Write one record as a tab-joined, newline-terminated line
    pub fn write_record(&mut self, record: &AlignmentRecord) -> Result<(), FilterError> {
        let mut result = Ok(());
        for (i, field) in record.fields().iter().enumerate() {
            if i > 0 {
                result = result.and_then(|_| self.writer.write_all(b"\t"));
            }
            result = result.and_then(|_| self.writer.write_all(field.as_bytes()));
        }
        result = result.and_then(|_| self.writer.write_all(b"\n"));
        result.map_err(|e| self.write_failed(e))?;
        self.records_written += 1;
        Ok(())
    }

    /// Flush and return the underlying writer without joining the encoder
    pub fn into_inner(self) -> Result<W, FilterError> {
        self.writer
            .into_inner()
            .map_err(|e| FilterError::Io(e.into_error()))
    }

    /// Flush, signal end of input and wait for the encoder to finish
    pub fn close(self) -> Result<(), FilterError> {
        let RecordSink {
            destination,
            writer,
            encoder,
            records_written,
        } = self;
        // Converting the error drops the pipe so the encoder sees end of input
        let flushed = writer.into_inner().map(drop).map_err(|e| e.into_error());
        let joined = match encoder {
            Some(encoder) => encoder.join(),
            None => Ok(()),
        };
        // The encoder's own failure explains a failed flush
        joined?;
        flushed.map_err(FilterError::Io)?;
        info!("Wrote {} records to '{}'", records_written, destination);
        Ok(())
    }
}
