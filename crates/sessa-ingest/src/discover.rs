//! Log-source discovery and line reading.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::error::IngestError;

/// One candidate log file under the log root.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFile {
    pub path: PathBuf,
    /// Parent directory relative to the log root, `/`-separated.
    pub project_path: String,
    /// File stem; the session id for lines that carry none.
    pub session_hint: String,
    pub size: u64,
    pub mtime_unix: i64,
}

/// Walk `root` recursively for `*.jsonl` files, sorted by path.
///
/// A missing or unreadable root is an error; unreadable entries below it
/// are skipped with a warning so one bad directory cannot abort the scan.
pub fn discover(root: &Path) -> Result<Vec<LogFile>, IngestError> {
    std::fs::read_dir(root).map_err(|source| IngestError::LogSourceUnavailable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable log entry");
                continue;
            }
        };
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|s| s.to_str()) != Some("jsonl")
        {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping log file");
                continue;
            }
        };
        let mtime_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(LogFile {
            project_path: project_path(root, entry.path()),
            session_hint: entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: entry.into_path(),
            size: meta.len(),
            mtime_unix,
        });
    }
    Ok(files)
}

fn project_path(root: &Path, file: &Path) -> String {
    file.parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Newline-terminated lines read from a byte offset.
pub struct LineReader {
    reader: BufReader<File>,
    offset: u64,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn open(path: &Path, offset: u64) -> Result<Self, IngestError> {
        let read_err = |source| IngestError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(read_err)?;
        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            buf: Vec::new(),
        })
    }

    /// Byte offset just past the last complete line returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next complete line, without its terminator. `None` at EOF or when
    /// only an unterminated tail remains (a writer mid-line); the tail is
    /// not consumed.
    pub fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 || self.buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        self.offset += n as u64;
        let mut line = &self.buf[..n - 1];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn finds_jsonl_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("-home-me-proj");
        std::fs::create_dir_all(proj.join("sub")).unwrap();
        std::fs::write(proj.join("s1.jsonl"), "{}\n").unwrap();
        std::fs::write(proj.join("sub").join("s2.jsonl"), "").unwrap();
        std::fs::write(proj.join("notes.txt"), "x").unwrap();

        let files = discover(tmp.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].session_hint, "s1");
        assert_eq!(files[0].project_path, "-home-me-proj");
        assert_eq!(files[0].size, 3);
        assert_eq!(files[1].project_path, "-home-me-proj/sub");
    }

    #[test]
    fn missing_root_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let err = discover(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, IngestError::LogSourceUnavailable { .. }));
    }

    #[test]
    fn partial_tail_is_not_consumed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.jsonl");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"{\"a\":1}\r\n{\"b\":2}\n{\"c\":").unwrap();

        let mut r = LineReader::open(&path, 0).unwrap();
        assert_eq!(r.next_line().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(r.next_line().unwrap(), None);
        assert_eq!(r.offset(), 17);

        let mut resumed = LineReader::open(&path, 9).unwrap();
        assert_eq!(resumed.next_line().unwrap().as_deref(), Some("{\"b\":2}"));
    }
}
