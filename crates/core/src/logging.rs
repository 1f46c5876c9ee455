//! Service logging: filter selection, the rolling file sink under the data
//! directory, and secret redaction for everything written to disk.
//!
//! These are the service's own diagnostics. Run output goes to the per-run
//! log files in the configured log directory and never passes through here.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

use crate::config;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,tower_http=warn";
/// Run lifecycle events are kept at debug in the file sink.
pub const FILE_DETAIL_FILTER: &str = "kometa_ui_core::runs=debug,kometa_ui_core::container=debug";
pub const DEFAULT_RETENTION_DAYS: usize = 14;
pub const SERVICE_LOG_PREFIX: &str = "kometa-ui";
pub const SERVICE_LOG_SUFFIX: &str = "log";
pub const REDACTED: &str = "***REDACTED***";

const BEARER_PREFIX: &str = "bearer ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSetup {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub retention_days: usize,
}

impl Default for LogSetup {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            rust_log_env: None,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub user: String,
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum ServiceLogSink {
    Ready {
        dir: PathBuf,
        retention_days: usize,
        appender: RollingFileAppender,
    },
    Disabled {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl ServiceLogSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { dir, .. } => Some(dir),
            Self::Disabled { dir, .. } => dir.as_deref(),
        }
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Disabled { reason, .. } => Some(reason),
        }
    }
}

/// Resolves the filters for both sinks.
///
/// Precedence: explicit CLI filter, then `-v`/`-vv`, then `RUST_LOG`, then
/// [`DEFAULT_LOG_FILTER`]. Noise suppression and file detail only apply when
/// the user did not pick a filter on the command line.
pub fn log_filters(setup: &LogSetup) -> LogFilters {
    let user = user_filter(setup);
    let implicit = setup.cli_filter.is_none() && setup.verbose == 0;

    if !implicit {
        return LogFilters {
            console: user.clone(),
            file: user.clone(),
            user,
        };
    }

    LogFilters {
        console: join_directives(&[DEFAULT_NOISE_FILTER, &user]),
        file: join_directives(&[DEFAULT_NOISE_FILTER, FILE_DETAIL_FILTER, &user]),
        user,
    }
}

fn user_filter(setup: &LogSetup) -> String {
    match (setup.cli_filter.as_deref(), setup.verbose) {
        (Some(filter), _) => filter.to_string(),
        (None, v) if v >= 2 => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, _) => setup
            .rust_log_env
            .as_deref()
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER)
            .to_string(),
    }
}

fn join_directives(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Daily rolling sink under `<data_dir>/service-logs`. Failures disable the
/// sink instead of aborting startup.
pub fn service_log_sink(setup: &LogSetup) -> ServiceLogSink {
    let Some(data_dir) = setup.data_dir.as_deref() else {
        return ServiceLogSink::Disabled {
            dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let dir = config::service_log_dir(data_dir);
    if let Err(err) = fs::create_dir_all(&dir) {
        return ServiceLogSink::Disabled {
            dir: Some(dir),
            reason: format!("failed to create service log directory: {err}"),
        };
    }

    let retention_days = if setup.retention_days == 0 {
        DEFAULT_RETENTION_DAYS
    } else {
        setup.retention_days
    };

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(SERVICE_LOG_PREFIX)
        .filename_suffix(SERVICE_LOG_SUFFIX)
        .max_log_files(retention_days)
        .build(&dir);

    match built {
        Ok(appender) => ServiceLogSink::Ready {
            dir,
            retention_days,
            appender,
        },
        Err(err) => ServiceLogSink::Disabled {
            dir: Some(dir),
            reason: format!("failed to open rolling service log: {err}"),
        },
    }
}

/// Masks URL userinfo and values of secret-looking `key=value` / `key: value`
/// pairs (Plex and TMDb tokens, API keys, passwords).
pub fn redact_secrets(input: &str) -> String {
    redact_assignments(&redact_userinfo(input))
}

fn redact_userinfo(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let authority_start = scheme_end + 3;
        let authority_len = rest[authority_start..]
            .find(|ch: char| ch.is_whitespace() || "/?#\"'<>".contains(ch))
            .unwrap_or(rest.len() - authority_start);
        let authority = &rest[authority_start..authority_start + authority_len];

        out.push_str(&rest[..authority_start]);
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                out.push_str(REDACTED);
                out.push_str(&authority[at..]);
            }
            _ => out.push_str(authority),
        }
        rest = &rest[authority_start + authority_len..];
    }

    out.push_str(rest);
    out
}

fn redact_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        if !matches!(bytes[pos], b'=' | b':') {
            pos += 1;
            continue;
        }

        let key_start = bytes[..pos]
            .iter()
            .rposition(|b| !(b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-'))
            .map_or(0, |idx| idx + 1);
        if key_start == pos || !is_secret_key(&input[key_start..pos].to_ascii_lowercase()) {
            pos += 1;
            continue;
        }

        match secret_value_span(input, pos + 1) {
            Some((start, end)) => {
                out.push_str(&input[copied..start]);
                out.push_str(REDACTED);
                copied = end;
                pos = end;
            }
            None => pos += 1,
        }
    }

    out.push_str(&input[copied..]);
    out
}

/// Byte span of the secret following a separator, skipping whitespace, a
/// `Bearer` scheme, and surrounding quotes.
fn secret_value_span(input: &str, after_separator: usize) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let mut start = after_separator;
    while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    if input
        .get(start..start + BEARER_PREFIX.len())
        .is_some_and(|word| word.eq_ignore_ascii_case(BEARER_PREFIX))
    {
        start += BEARER_PREFIX.len();
    }
    if start >= bytes.len() {
        return None;
    }

    let (start, end) = if matches!(bytes[start], b'"' | b'\'') {
        let quote = bytes[start] as char;
        let inner = start + 1;
        let end = input[inner..]
            .find(quote)
            .map_or(input.len(), |offset| inner + offset);
        (inner, end)
    } else {
        let end = input[start..]
            .find(|ch: char| ch.is_ascii_whitespace() || "&,;)]}\"'".contains(ch))
            .map_or(input.len(), |offset| start + offset);
        (start, end)
    };

    (end > start).then_some((start, end))
}

fn is_secret_key(key: &str) -> bool {
    matches!(key, "key" | "pwd" | "passwd" | "authorization")
        || ["token", "secret", "password"]
            .iter()
            .any(|needle| key.contains(needle))
        || ["_key", "-key", "apikey"]
            .iter()
            .any(|suffix| key.ends_with(suffix))
}

/// [`MakeWriter`] wrapper that redacts every complete line before it reaches
/// the wrapped writer.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        let redacted = redact_secrets(&String::from_utf8_lossy(chunk));
        self.inner.write_all(redacted.as_bytes())
    }

    fn drain_partial(&mut self) -> io::Result<()> {
        if self.line.is_empty() {
            return Ok(());
        }
        let partial = std::mem::take(&mut self.line);
        self.emit(&partial)
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        if let Some(last_newline) = self.line.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.line.drain(..=last_newline).collect();
            self.emit(&complete)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_partial()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
