//! Append-only chat history backed by `history.log`.
//!
//! The file gets a human-readable timestamp prefix per line; the in-memory
//! mirror keeps live lines unprefixed and replays file lines verbatim after
//! a restart. The file is never parsed back, only replayed.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use tracing::warn;

pub struct ChatHistory {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    lines: Vec<String>,
}

impl ChatHistory {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lines = load_lines(&path);
        Self { inner: Mutex::new(Inner { path, lines }) }
    }

    pub fn append(&self, line: &str) {
        let mut inner = self.inner.lock();
        let stamped = format!("{}: {}\n", Local::now().format("%a %b %-d %H:%M:%S %Y"), line);
        if let Err(e) = append_raw(&inner.path, &stamped) {
            warn!(path = %inner.path.display(), error = %e, "failed to append chat history");
        }
        inner.lines.push(line.to_string());
    }

    /// Ordered replay of everything seen so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }
}

fn load_lines(path: &Path) -> Vec<String> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    BufReader::new(file).lines().map_while(Result::ok).collect()
}

fn append_raw(path: &Path, data: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(data.as_bytes())
}
