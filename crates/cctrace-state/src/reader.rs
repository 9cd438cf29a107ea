//! Incremental transcript reader
//!
//! Reads the records appended to a transcript since a stored byte offset.
//! The file length is captured when the reader opens; records appended
//! while a run is in progress are left for the next run. Only complete,
//! newline-terminated lines are consumed, so a line the writer is still
//! appending is never split. This holds for a final line that is complete
//! JSON but lacks its newline: it is read once the writer terminates it.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use cctrace_core::{parse_line, PositionedRecord};
use tracing::{debug, warn};

use crate::StateError;

/// What a read found
#[derive(Debug)]
pub enum ReadOutcome {
    /// The transcript does not exist (yet)
    Missing,
    /// Nothing past the offset. `offset` is where the next read starts,
    /// which is 0 when the file shrank below the stored offset.
    NoNewData { offset: u64 },
    Records(NewRecords),
}

/// Current length of a transcript, `None` when it does not exist
pub fn transcript_len(path: &Path) -> Result<Option<u64>, StateError> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(Some(m.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Open `path` and position it at `from_offset`.
///
/// A stored offset past the end of the file means the transcript was
/// truncated or replaced; reading restarts from the beginning.
pub fn read_new(path: &Path, from_offset: u64) -> Result<ReadOutcome, StateError> {
    let len = match transcript_len(path)? {
        Some(len) => len,
        None => return Ok(ReadOutcome::Missing),
    };

    let (start, restarted) = if from_offset > len {
        warn!(
            path = %path.display(),
            stored = from_offset,
            len,
            "Transcript shorter than stored offset, restarting from 0"
        );
        (0, true)
    } else {
        (from_offset, false)
    };

    if start >= len {
        return Ok(ReadOutcome::NoNewData { offset: start });
    }

    let mut file = File::open(path)?;
    if start > 0 {
        file.seek(SeekFrom::Start(start))?;
    }
    debug!(path = %path.display(), start, len, "Reading transcript");

    Ok(ReadOutcome::Records(NewRecords {
        path: path.to_path_buf(),
        reader: BufReader::new(file.take(len - start)),
        start,
        position: start,
        restarted,
        check_first_line: start > 0,
        skipped: 0,
        done: false,
    }))
}

/// Lazy sequence of the records between the start offset and the file
/// length seen at open time
#[derive(Debug)]
pub struct NewRecords {
    path: PathBuf,
    reader: BufReader<Take<File>>,
    start: u64,
    /// Byte offset just past the last complete line consumed
    position: u64,
    restarted: bool,
    check_first_line: bool,
    skipped: usize,
    done: bool,
}

impl NewRecords {
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset to resume from after the records yielded so far
    pub fn offset(&self) -> u64 {
        self.position
    }

    /// True when the stored offset was discarded because the file shrank
    pub fn restarted(&self) -> bool {
        self.restarted
    }

    /// Malformed lines skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for NewRecords {
    type Item = PositionedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        while !self.done {
            buf.clear();
            let n = match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Transcript read failed");
                    self.done = true;
                    return None;
                }
            };

            // Incomplete trailing line: leave it for the next run
            if buf.last() != Some(&b'\n') {
                self.done = true;
                return None;
            }

            let line_start = self.position;
            self.position += n as u64;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();

            // Skip partial first line when reading from offset
            if self.check_first_line {
                self.check_first_line = false;
                if !line.is_empty() && !line.starts_with('{') {
                    continue;
                }
            }
            if line.is_empty() {
                continue;
            }

            match parse_line(line) {
                Ok(Some(record)) => {
                    return Some(PositionedRecord {
                        offset: line_start,
                        end_offset: self.position,
                        record,
                    })
                }
                Ok(None) => continue,
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        offset = line_start,
                        error = %e,
                        "Skipping malformed transcript line"
                    );
                }
            }
        }
        None
    }
}
