//! Size-capped rotating run log.
//!
//! Each session appends its streamed lines to timestamped text files,
//! rolling over to a new part once the current one reaches the size cap.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 5 MiB per log part.
pub const MAX_PART_BYTES: u64 = 5 * 1024 * 1024;

pub struct RotatingLog {
    dir: PathBuf,
    stem: String,
    max_bytes: u64,
    state: Mutex<LogState>,
}

#[derive(Default)]
struct LogState {
    part: u32,
    created: Vec<PathBuf>,
}

impl RotatingLog {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self::with_max_bytes(dir, stem, MAX_PART_BYTES)
    }

    pub fn with_max_bytes(dir: impl Into<PathBuf>, stem: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(LogState {
                part: 1,
                created: Vec::new(),
            }),
        }
    }

    /// Append one line, rotating to the next part first if the current one
    /// has reached the cap.
    pub fn append(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::create_dir_all(&self.dir)?;

        let mut path = self.part_path(state.part);
        if file_len(&path)? >= self.max_bytes {
            state.part += 1;
            path = self.part_path(state.part);
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        if !state.created.contains(&path) {
            state.created.push(path);
        }
        Ok(())
    }

    /// Paths of every part written so far, in creation order.
    pub fn created_parts(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .created
            .clone()
    }

    fn part_path(&self, part: u32) -> PathBuf {
        self.dir.join(format!("{}_part{}.txt", self.stem, part))
    }
}

fn file_len(path: &Path) -> io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}
