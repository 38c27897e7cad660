use std::io;
use std::process::ExitStatus;

/// Fatal conditions of a filtering run. None of these are retried or skipped:
/// the inputs are expected to be well formed and name sorted.
#[derive(Debug)]
pub enum FilterError {
    /// A source file or an external program could not be opened/started
    Open { source: String, reason: String },
    /// A line could not be scanned, or the stream is out of order
    Scan {
        source: String,
        line: usize,
        reason: String,
    },
    /// A scanned record is missing a field the engine needs
    MalformedRecord {
        source: String,
        read: String,
        reason: String,
    },
    /// An external program exited abnormally
    Subprocess {
        program: String,
        status: Option<ExitStatus>,
        stderr: String,
    },
    Io(io::Error),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Open { source, reason } => {
                write!(f, "Failed to open '{}': {}", source, reason)
            }
            FilterError::Scan {
                source,
                line,
                reason,
            } => write!(f, "Failed to scan '{}' at line {}: {}", source, line, reason),
            FilterError::MalformedRecord {
                source,
                read,
                reason,
            } => write!(
                f,
                "Malformed record for read '{}' in '{}': {}",
                read, source, reason
            ),
            FilterError::Subprocess {
                program,
                status,
                stderr,
            } => {
                match status {
                    Some(status) => write!(f, "'{}' failed ({})", program, status)?,
                    None => write!(f, "'{}' could not be waited on", program)?,
                }
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            FilterError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FilterError {
    fn from(e: io::Error) -> Self {
        FilterError::Io(e)
    }
}

impl From<FilterError> for io::Error {
    fn from(e: FilterError) -> Self {
        let kind = match &e {
            FilterError::Io(inner) => inner.kind(),
            FilterError::Open { .. } => io::ErrorKind::NotFound,
            FilterError::Scan { .. } | FilterError::MalformedRecord { .. } => {
                io::ErrorKind::InvalidData
            }
            FilterError::Subprocess { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, e.to_string())
    }
}
