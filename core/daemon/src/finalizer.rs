//! Seals an output file at Stop.

use filewriter_protocol::{epoch_seconds, parse_timestamp};
use serde::Serialize;
use std::path::PathBuf;

use crate::accumulator::Snapshot;
use crate::nexus_file::{read_entry, OutputFile, SealedEntry};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeReport {
    pub file_path: PathBuf,
    pub start_time: String,
    pub end_time: String,
    pub duration: f64,
    pub features_written: usize,
}

/// `end_time - start_time` in seconds.
pub fn compute_duration(start_time: &str, end_time: &str) -> Result<f64, String> {
    let start = parse_timestamp(start_time)
        .ok_or_else(|| format!("start_time {} is not ISO-8601", start_time))?;
    let end = parse_timestamp(end_time)
        .ok_or_else(|| format!("end_time {} is not ISO-8601", end_time))?;
    Ok(epoch_seconds(&end) - epoch_seconds(&start))
}

pub fn finalize(
    file: &mut OutputFile,
    snapshot: Snapshot<'_>,
    end_time: &str,
) -> Result<FinalizeReport, String> {
    let duration = compute_duration(&snapshot.metadata.start_time, end_time)?;

    file.seal(&SealedEntry {
        metadata: snapshot.metadata,
        end_time,
        duration,
        features: snapshot.unflushed(),
    })?;

    if file.features_written() != snapshot.features.len() {
        return Err(format!(
            "wrote {} features but accumulated {}",
            file.features_written(),
            snapshot.features.len()
        ));
    }

    // Read back what an external reader would see before acknowledging.
    let entry = read_entry(file.path())?;
    if entry.swmr_mode {
        return Err("single-writer indicator still set after seal".to_string());
    }
    if !entry.features.iter().copied().eq(snapshot.values()) {
        return Err(format!(
            "features mismatch after seal: wrote {}, read {}",
            snapshot.features.len(),
            entry.features.len()
        ));
    }

    Ok(FinalizeReport {
        file_path: file.path().to_path_buf(),
        start_time: snapshot.metadata.start_time.clone(),
        end_time: end_time.to_string(),
        duration,
        features_written: entry.features.len(),
    })
}
