//! Tail extraction over run log files.
//!
//! `extract_tail` scans backward from end-of-file in fixed-size chunks and
//! stops as soon as enough newlines are buffered, so memory and I/O follow the
//! requested tail size rather than the file size.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const TAIL_CHUNK_SIZE: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// Lines exist above the returned window.
    pub has_more: bool,
}

impl LogTail {
    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            has_more: false,
        }
    }
}

/// Returns the last `line_count` lines of `path`.
///
/// A missing file yields an `io::ErrorKind::NotFound` error. Invalid UTF-8 is
/// decoded lossily.
pub fn extract_tail(path: &Path, line_count: i64) -> io::Result<LogTail> {
    if line_count <= 0 {
        return Ok(LogTail::empty());
    }
    let wanted = usize::try_from(line_count).unwrap_or(usize::MAX);

    let mut file = File::open(path)?;
    let mut end = file.seek(SeekFrom::End(0))?;
    let mut buffer: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // One newline more than requested proves a line exists above the window,
    // even when the file ends with a trailing newline.
    while end > 0 && newlines <= wanted {
        let read_size = TAIL_CHUNK_SIZE.min(end);
        end -= read_size;
        file.seek(SeekFrom::Start(end))?;

        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|byte| **byte == b'\n').count();

        chunk.extend_from_slice(&buffer);
        buffer = chunk;
    }

    let lines = split_lines(&buffer);
    let has_more = lines.len() > wanted;
    let start = lines.len().saturating_sub(wanted);

    Ok(LogTail {
        lines: lines[start..]
            .iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect(),
        has_more,
    })
}

/// Splits on `\n`, trimming a preceding `\r`. A trailing newline does not
/// produce an empty final line.
fn split_lines(buffer: &[u8]) -> Vec<&[u8]> {
    if buffer.is_empty() {
        return Vec::new();
    }

    let body = buffer.strip_suffix(b"\n").unwrap_or(buffer);
    body.split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

/// Most recently modified regular file in `dir`.
pub fn find_latest(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    entries
        .flatten()
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max_by(|(left_time, left_path), (right_time, right_path)| {
            left_time
                .cmp(right_time)
                .then_with(|| left_path.cmp(right_path))
        })
        .map(|(_, path)| path)
}
