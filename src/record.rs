//! Textual alignment records as produced by `samtools view`.

/// Marker carried by the reference names of ERCC spike-in controls
pub const ERCC_MARKER: &str = "ERCC";

/// One alignment line split into its tab-separated fields.
///
/// Fields are kept verbatim so that a record can be written back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    fields: Vec<String>,
}

impl AlignmentRecord {
    pub const READ_ID: usize = 0;
    pub const REFERENCE_NAME: usize = 2;
    pub const SEQUENCE: usize = 9;
    /// First field searched for the edit-distance tag
    pub const DISTANCE_TAG: usize = 14;
    /// Records with fewer fields cannot carry the edit-distance tag
    pub const MIN_FIELDS: usize = Self::DISTANCE_TAG + 1;

    /// Split a line into fields. Surrounding whitespace is dropped; returns
    /// `None` for a blank line.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(AlignmentRecord {
            fields: line.split('\t').map(str::to_string).collect(),
        })
    }

    pub fn read_id(&self) -> &str {
        &self.fields[Self::READ_ID]
    }

    pub fn reference_name(&self) -> Option<&str> {
        self.fields.get(Self::REFERENCE_NAME).map(String::as_str)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// True when the record maps to an ERCC spike-in
    pub fn is_ercc(&self) -> bool {
        self.reference_name()
            .is_some_and(|name| name.contains(ERCC_MARKER))
    }

    /// Extract the alignment length (length of the sequence field) and the
    /// edit distance stored under `<tag>:i:`.
    pub fn length_and_distance(&self, tag: &str) -> Result<(usize, u32), String> {
        if self.fields.len() < Self::MIN_FIELDS {
            return Err(format!(
                "expected at least {} fields, found {}",
                Self::MIN_FIELDS,
                self.fields.len()
            ));
        }
        let length = self.fields[Self::SEQUENCE].len();

        let prefix = format!("{}:i:", tag);
        let value = self.fields[Self::DISTANCE_TAG..]
            .iter()
            .find_map(|field| field.strip_prefix(prefix.as_str()))
            .ok_or_else(|| format!("no {}:i: tag", tag))?;
        let distance = value
            .parse::<u32>()
            .map_err(|e| format!("invalid {} value '{}': {}", tag, value, e))?;

        Ok((length, distance))
    }

    /// Join the fields back into a line, without the trailing newline
    pub fn to_line(&self) -> String {
        self.fields.join("\t")
    }
}

/// Length and edit distance of one alignment, with its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredAlignment {
    pub length: usize,
    pub edit_distance: u32,
    pub score: f64,
}

impl ScoredAlignment {
    /// `score = length - edit_distance * penalty`
    pub fn new(length: usize, edit_distance: u32, penalty: f64) -> Self {
        ScoredAlignment {
            length,
            edit_distance,
            score: length as f64 - edit_distance as f64 * penalty,
        }
    }
}
