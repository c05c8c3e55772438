//! Output file storage.
//!
//! Each run produces one self-contained SQLite file. Datasets are addressed by
//! their entry path (`entry/start_time`, `entry/user_1/affiliation`, ...),
//! `entry/features` lives in its own table, and the single-writer indicator
//! is the `swmr_mode` row of `file_attributes`. A run started without SWMR
//! never sets the indicator.
//!
//! Feature values are unsigned 64-bit; SQLite integers are signed, so the
//! value is stored as its two's-complement bit pattern and cast back on read.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::accumulator::{EntryMetadata, Feature};

pub const FORMAT_VERSION: &str = "1";
pub const SWMR_MODE_ATTRIBUTE: &str = "swmr_mode";
pub const START_TIME_PATH: &str = "entry/start_time";
pub const END_TIME_PATH: &str = "entry/end_time";
pub const DURATION_PATH: &str = "entry/duration";
pub const TITLE_PATH: &str = "entry/title";
pub const AFFILIATION_PATH: &str = "entry/user_1/affiliation";
pub const JOB_ID_PATH: &str = "entry/job_id";

/// Derived fields written at Stop.
#[derive(Debug, Clone, Copy)]
pub struct SealedEntry<'a> {
    pub metadata: &'a EntryMetadata,
    pub end_time: &'a str,
    pub duration: f64,
    pub features: &'a [Feature],
}

/// What an external reader sees in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryContents {
    pub swmr_mode: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<f64>,
    pub title: Option<String>,
    pub user_affiliation: Option<String>,
    pub job_id: Option<String>,
    pub features: Vec<u64>,
    pub feature_sources: Vec<Option<String>>,
}

pub struct OutputFile {
    path: PathBuf,
    conn: Connection,
    next_seq: i64,
}

impl OutputFile {
    /// Creates a new file with the Start metadata, in single-writer mode
    /// when `metadata.use_swmr` is set.
    /// Refuses to touch a file that already exists.
    pub fn create(path: &Path, metadata: &EntryMetadata) -> Result<Self, String> {
        if path.exists() {
            return Err("file already exists".to_string());
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                return Err(format!("directory {} does not exist", parent.display()));
            }
            _ => {}
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|err| format!("Failed to create output file: {}", err))?;

        let mut file = Self {
            path: path.to_path_buf(),
            conn,
            next_seq: 0,
        };

        if let Err(err) = file.init(metadata) {
            file.discard();
            return Err(err);
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn features_written(&self) -> usize {
        self.next_seq as usize
    }

    fn init(&mut self, metadata: &EntryMetadata) -> Result<(), String> {
        self.conn
            .pragma_update(None, "journal_mode", "DELETE")
            .map_err(|err| format!("Failed to set journal mode: {}", err))?;
        self.conn
            .pragma_update(None, "synchronous", "FULL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;

        let tx = self
            .conn
            .transaction()
            .map_err(|err| format!("Failed to begin init transaction: {}", err))?;
        tx.execute_batch(
            "CREATE TABLE file_attributes (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
             );
             CREATE TABLE datasets (
                path TEXT PRIMARY KEY,
                text_value TEXT,
                real_value REAL
             );
             CREATE TABLE features (
                seq INTEGER PRIMARY KEY,
                value INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                source TEXT
             );",
        )
        .map_err(|err| format!("Failed to create output schema: {}", err))?;

        for (name, value) in [
            (SWMR_MODE_ATTRIBUTE, bool_attribute(metadata.use_swmr)),
            ("format_version", FORMAT_VERSION),
            ("writer", concat!("filewriter-daemon/", env!("CARGO_PKG_VERSION"))),
        ] {
            tx.execute(
                "INSERT INTO file_attributes (name, value) VALUES (?1, ?2)",
                params![name, value],
            )
            .map_err(|err| format!("Failed to write attribute {}: {}", name, err))?;
        }

        write_metadata(&tx, metadata)?;
        tx.commit()
            .map_err(|err| format!("Failed to commit output header: {}", err))
    }

    /// Appends a batch of features in one transaction. The indicator stays set.
    pub fn append_features(&mut self, features: &[Feature]) -> Result<(), String> {
        if features.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction()
            .map_err(|err| format!("Failed to begin flush transaction: {}", err))?;
        let next_seq = insert_features(&tx, self.next_seq, features)?;
        tx.commit()
            .map_err(|err| format!("Failed to commit features: {}", err))?;
        self.next_seq = next_seq;
        Ok(())
    }

    /// Writes the final datasets and then clears the single-writer indicator.
    ///
    /// The data transaction commits with `synchronous=FULL` before the
    /// indicator update starts, so a reader never sees `swmr_mode=false` on
    /// an incomplete entry.
    pub fn seal(&mut self, entry: &SealedEntry<'_>) -> Result<(), String> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| format!("Failed to begin seal transaction: {}", err))?;
        let next_seq = insert_features(&tx, self.next_seq, entry.features)?;
        write_metadata(&tx, entry.metadata)?;
        upsert_text(&tx, END_TIME_PATH, entry.end_time)?;
        upsert_real(&tx, DURATION_PATH, entry.duration)?;
        tx.commit()
            .map_err(|err| format!("Failed to commit final datasets: {}", err))?;
        self.next_seq = next_seq;
        if !entry.metadata.use_swmr {
            return Ok(());
        }

        let updated = self
            .conn
            .execute(
                "UPDATE file_attributes SET value = 'false' WHERE name = ?1",
                params![SWMR_MODE_ATTRIBUTE],
            )
            .map_err(|err| format!("Failed to clear {}: {}", SWMR_MODE_ATTRIBUTE, err))?;
        if updated != 1 {
            return Err(format!("{} attribute is missing", SWMR_MODE_ATTRIBUTE));
        }
        Ok(())
    }

    /// Closes the file and removes it along with any journal.
    pub fn discard(self) {
        let path = self.path;
        drop(self.conn);
        for candidate in [path.clone(), journal_path(&path)] {
            match fs_err::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to remove discarded output file");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn break_schema_for_test(&self) {
        self.conn
            .execute_batch("DROP TABLE datasets;")
            .expect("drop datasets");
    }
}

/// Opens a file read-only and returns its entry.
pub fn read_entry(path: &Path) -> Result<EntryContents, String> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| format!("Failed to open output file: {}", err))?;

    let swmr_mode: String = conn
        .query_row(
            "SELECT value FROM file_attributes WHERE name = ?1",
            params![SWMR_MODE_ATTRIBUTE],
            |row| row.get(0),
        )
        .map_err(|err| format!("Failed to read {}: {}", SWMR_MODE_ATTRIBUTE, err))?;

    let text = |dataset: &str| -> Result<Option<String>, String> {
        conn.query_row(
            "SELECT text_value FROM datasets WHERE path = ?1",
            params![dataset],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map(Option::flatten)
        .map_err(|err| format!("Failed to read {}: {}", dataset, err))
    };

    let duration = conn
        .query_row(
            "SELECT real_value FROM datasets WHERE path = ?1",
            params![DURATION_PATH],
            |row| row.get::<_, Option<f64>>(0),
        )
        .optional()
        .map(Option::flatten)
        .map_err(|err| format!("Failed to read {}: {}", DURATION_PATH, err))?;

    let mut stmt = conn
        .prepare("SELECT value, source FROM features ORDER BY seq ASC")
        .map_err(|err| format!("Failed to prepare features query: {}", err))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))
        .map_err(|err| format!("Failed to read features: {}", err))?;
    let mut features = Vec::new();
    let mut feature_sources = Vec::new();
    for row in rows {
        let (stored, source) =
            row.map_err(|err| format!("Failed to decode feature row: {}", err))?;
        features.push(stored as u64);
        feature_sources.push(source);
    }

    Ok(EntryContents {
        swmr_mode: swmr_mode == "true",
        start_time: text(START_TIME_PATH)?,
        end_time: text(END_TIME_PATH)?,
        duration,
        title: text(TITLE_PATH)?,
        user_affiliation: text(AFFILIATION_PATH)?,
        job_id: text(JOB_ID_PATH)?,
        features,
        feature_sources,
    })
}

fn bool_attribute(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

fn insert_features(conn: &Connection, first_seq: i64, features: &[Feature]) -> Result<i64, String> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO features (seq, value, timestamp, source) VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(|err| format!("Failed to prepare feature insert: {}", err))?;
    let mut seq = first_seq;
    for feature in features {
        stmt.execute(params![
            seq,
            feature.value as i64,
            feature.timestamp,
            feature.source_name
        ])
            .map_err(|err| format!("Failed to insert feature {}: {}", seq, err))?;
        seq += 1;
    }
    Ok(seq)
}

fn write_metadata(conn: &Connection, metadata: &EntryMetadata) -> Result<(), String> {
    upsert_text(conn, START_TIME_PATH, &metadata.start_time)?;
    upsert_text(conn, TITLE_PATH, &metadata.title)?;
    upsert_text(conn, AFFILIATION_PATH, &metadata.user_affiliation)?;
    if let Some(job_id) = &metadata.job_id {
        upsert_text(conn, JOB_ID_PATH, job_id)?;
    }
    Ok(())
}

fn upsert_text(conn: &Connection, dataset: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO datasets (path, text_value) VALUES (?1, ?2) \
         ON CONFLICT(path) DO UPDATE SET text_value = excluded.text_value",
        params![dataset, value],
    )
    .map_err(|err| format!("Failed to write {}: {}", dataset, err))?;
    Ok(())
}

fn upsert_real(conn: &Connection, dataset: &str, value: f64) -> Result<(), String> {
    conn.execute(
        "INSERT INTO datasets (path, real_value) VALUES (?1, ?2) \
         ON CONFLICT(path) DO UPDATE SET real_value = excluded.real_value",
        params![dataset, value],
    )
    .map_err(|err| format!("Failed to write {}: {}", dataset, err))?;
    Ok(())
}
