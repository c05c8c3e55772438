//! In-memory aggregation of feature values between Start and Stop.
//!
//! The accumulator is owned by the writer session and assumes
//! single-threaded access. A [`Snapshot`] borrows it immutably, so no
//! append can interleave with a finalizer reading the snapshot.

/// Metadata carried by the Start command and written into the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub job_id: Option<String>,
    pub title: String,
    pub user_affiliation: String,
    pub start_time: String,
    /// Whether the file carries the single-writer indicator until Stop.
    pub use_swmr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub value: u64,
    pub timestamp: String,
    pub source_name: Option<String>,
}

#[derive(Debug)]
pub struct Accumulator {
    metadata: EntryMetadata,
    features: Vec<Feature>,
    flushed: usize,
}

impl Accumulator {
    pub fn new(metadata: EntryMetadata) -> Self {
        Self {
            metadata,
            features: Vec::new(),
            flushed: 0,
        }
    }

    pub fn append(
        &mut self,
        value: u64,
        timestamp: impl Into<String>,
        source_name: Option<String>,
    ) {
        self.features.push(Feature {
            value,
            timestamp: timestamp.into(),
            source_name,
        });
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// Values appended since the last successful flush.
    pub fn pending(&self) -> &[Feature] {
        &self.features[self.flushed..]
    }

    pub fn flushed(&self) -> usize {
        self.flushed
    }

    pub fn mark_flushed(&mut self, count: usize) {
        self.flushed = self.flushed.saturating_add(count).min(self.features.len());
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            metadata: &self.metadata,
            features: &self.features,
            flushed: self.flushed,
        }
    }
}

/// Read-only view handed to the finalizer.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub metadata: &'a EntryMetadata,
    pub features: &'a [Feature],
    pub flushed: usize,
}

impl<'a> Snapshot<'a> {
    pub fn values(&self) -> impl Iterator<Item = u64> + 'a {
        self.features.iter().map(|feature| feature.value)
    }

    /// Features the output file has not seen yet.
    pub fn unflushed(&self) -> &'a [Feature] {
        &self.features[self.flushed..]
    }
}
