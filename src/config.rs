use std::io;

/// Thresholds and switches for one filtering run
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// Alignments shorter than this are not scored
    pub min_length: usize,
    /// Sample alignments with a larger edit distance are dropped
    pub max_distance: u32,
    /// Score subtracted per edit
    pub penalty: f64,
    /// A contamination score within this margin of the sample score rejects the read
    pub margin: f64,
    /// Stop after this many sample reads
    pub limit: Option<u64>,
    /// Drop reads mapping to ERCC spike-ins before any other filter
    pub exclude_ercc: bool,
    /// SAM tag holding the edit distance
    pub distance_tag: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            min_length: 60,
            max_distance: 5,
            penalty: 2.0,
            margin: 1.0,
            limit: None,
            exclude_ercc: false,
            distance_tag: "nM".to_string(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> io::Result<()> {
        if !self.penalty.is_finite() || self.penalty < 0.0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Penalty must be a non-negative number, got {}", self.penalty),
            ));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Margin must be a non-negative number, got {}", self.margin),
            ));
        }
        if self.distance_tag.len() != 2 || !self.distance_tag.is_ascii() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Edit distance tag must be two characters, got '{}'",
                    self.distance_tag
                ),
            ));
        }
        Ok(())
    }
}
