//! Output processor - per-agent view of recent PTY output.
//!
//! Keeps a bounded buffer of recent output, detects completion/block
//! signals on the ANSI-stripped tail, and runs the extract-then-discard
//! protocol whenever the buffer is trimmed so nothing learnable is lost.

use once_cell::sync::Lazy;
use regex::Regex;

/// Soft cap on the buffer; a trim runs once this is exceeded.
pub const TRIM_AT: usize = 300 * 1024;
/// Bytes of tail kept after a trim.
pub const KEEP: usize = 128 * 1024;
/// Signal detection window over the ANSI-stripped buffer tail.
const SIGNAL_WINDOW: usize = 500;

const MAX_EXTRACT_FILES: usize = 20;
const MAX_EXTRACT_ERRORS: usize = 5;
const MAX_APPROACH_LINES: usize = 3;

static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]|\r")
        .unwrap()
});

/// Canonical source-file path pattern shared with the verification runner.
pub static FILE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(^|\s)((?:src|lib|app|pages|components|hooks|utils|test|tests|spec|config|public|assets|api|scripts|bin|deploy|docker|k8s|infra)/[^\s,)"']+\.[a-z]{1,5})"#,
    )
    .unwrap()
});

static ERROR_LINE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"error\[E\d+\]:\s*(.{10,100})").unwrap(),
        Regex::new(r"TS\d{4,5}:\s*(.{10,80})").unwrap(),
        Regex::new(r"Error:\s*(.{10,100})").unwrap(),
        Regex::new(r"FAIL\s+(.{10,80})").unwrap(),
    ]
});

static APPROACH_KEYWORDS: &[&str] = &[
    "approach", "strategy", "plan", "trying", "attempt", "will", "going to", "let me",
];

// Line-anchored: the protocol demands the token on its own line, and the
// anchor keeps echoes of our own instructions ("...print HOMER_DONE...")
// from triggering a scan hit.
static SIGNAL_DONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[\s>⏺]*HOMER_DONE\b").unwrap());
static SIGNAL_BLOCKED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[\s>⏺]*HOMER_BLOCKED(?:\s*:\s*([^\n]*))?").unwrap());

/// Remove ANSI escape sequences (CSI, OSC, single-char) and bare CRs.
pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Signal detected in the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Done,
    Blocked { reason: String },
}

/// What the extract-then-discard protocol salvaged from a trimmed prefix.
#[derive(Debug, Clone, Default)]
pub struct CompactionExtract {
    pub file_paths: Vec<String>,
    pub errors: Vec<String>,
    pub approach_note: Option<String>,
}

impl CompactionExtract {
    pub fn is_empty(&self) -> bool {
        self.file_paths.is_empty() && self.errors.is_empty() && self.approach_note.is_none()
    }
}

/// Bounded per-agent output buffer with signal detection.
#[derive(Debug)]
pub struct OutputBuffer {
    data: String,
    /// Digest of verify history, re-prepended on every trim.
    verify_digest: String,
    /// Signals are suppressed after a hit until the agent returns to working.
    armed: bool,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            data: String::new(),
            verify_digest: String::new(),
            armed: true,
        }
    }

    /// Append a chunk of raw PTY bytes. Returns the compaction extract if
    /// the append pushed the buffer over [`TRIM_AT`].
    pub fn append(&mut self, bytes: &[u8]) -> Option<CompactionExtract> {
        self.data.push_str(&String::from_utf8_lossy(bytes));
        if self.data.len() <= TRIM_AT {
            return None;
        }
        Some(self.trim())
    }

    /// Extract-then-discard: salvage learnable content from the prefix that
    /// is about to be dropped, then keep `digest + tail[-KEEP:]`.
    fn trim(&mut self) -> CompactionExtract {
        let mut cut = self.data.len().saturating_sub(KEEP);
        while cut < self.data.len() && !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        let prefix = strip_ansi(&self.data[..cut]);
        let extract = extract_from_prefix(&prefix);

        let tail = self.data.split_off(cut);
        self.data = format!("{}{}", self.verify_digest, tail);
        extract
    }

    /// Scan the ANSI-stripped last [`SIGNAL_WINDOW`] chars for a completion
    /// or block signal. Tokens count only at the start of a line (the
    /// protocol requires them on their own line). Exactly one signal per
    /// scan, earliest match wins; after a hit no further signals fire
    /// until [`rearm`](Self::rearm).
    pub fn scan_signal(&mut self) -> Option<Signal> {
        if !self.armed {
            return None;
        }
        let stripped = strip_ansi(&self.data);
        let window_start = floor_char_boundary(&stripped, stripped.len().saturating_sub(SIGNAL_WINDOW));
        let window = &stripped[window_start..];

        let done_at = SIGNAL_DONE_RE.find(window).map(|m| m.start());
        let blocked = SIGNAL_BLOCKED_RE.captures(window);
        let blocked_at = blocked
            .as_ref()
            .and_then(|c| c.get(0))
            .map(|m| m.start());

        let signal = match (done_at, blocked_at) {
            (Some(d), Some(b)) if d <= b => Some(Signal::Done),
            (Some(_), None) => Some(Signal::Done),
            (_, Some(_)) => {
                let reason = blocked
                    .and_then(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                Some(Signal::Blocked { reason })
            }
            (None, None) => None,
        };

        if signal.is_some() {
            self.armed = false;
        }
        signal
    }

    /// Re-enable signal detection; called when the agent status returns to
    /// working.
    pub fn rearm(&mut self) {
        self.armed = true;
    }

    /// Prefix re-applied to the buffer on every trim.
    pub fn set_verify_digest(&mut self, digest: String) {
        self.verify_digest = digest;
    }

    /// Full current contents (raw, for replay).
    pub fn contents(&self) -> &str {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Last `n` non-empty lines, ANSI-stripped.
    pub fn tail_lines_stripped(&self, n: usize) -> Vec<String> {
        let stripped = strip_ansi(&self.data);
        let lines: Vec<&str> = stripped
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        lines
            .iter()
            .rev()
            .take(n)
            .rev()
            .map(|s| s.to_string())
            .collect()
    }

    /// The last non-empty ANSI-stripped line, for prompt readiness polling.
    pub fn last_line_stripped(&self) -> String {
        self.tail_lines_stripped(1).pop().unwrap_or_default()
    }

    /// File paths mentioned anywhere in the current buffer.
    pub fn mentioned_files(&self) -> Vec<String> {
        extract_file_paths(&strip_ansi(&self.data), usize::MAX)
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn extract_from_prefix(prefix: &str) -> CompactionExtract {
    let file_paths = extract_file_paths(prefix, MAX_EXTRACT_FILES);

    let mut errors = Vec::new();
    for line in prefix.lines() {
        if errors.len() >= MAX_EXTRACT_ERRORS {
            break;
        }
        if ERROR_LINE_RES.iter().any(|re| re.is_match(line)) {
            let entry = truncate(line.trim(), 200);
            if !errors.contains(&entry) {
                errors.push(entry);
            }
        }
    }

    let mut approach = Vec::new();
    for line in prefix.lines() {
        if approach.len() >= MAX_APPROACH_LINES {
            break;
        }
        let lower = line.to_lowercase();
        if APPROACH_KEYWORDS.iter().any(|k| lower.contains(k)) {
            let entry = truncate(line.trim(), 200);
            if !entry.is_empty() && !approach.contains(&entry) {
                approach.push(entry);
            }
        }
    }
    let approach_note = if approach.is_empty() {
        None
    } else {
        Some(approach.join(" | "))
    };

    CompactionExtract {
        file_paths,
        errors,
        approach_note,
    }
}

/// Unique file paths matching the canonical pattern, in order of first
/// appearance.
pub fn extract_file_paths(text: &str, cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap_match in FILE_PATH_RE.captures_iter(text) {
        if out.len() >= cap {
            break;
        }
        let path = cap_match[2].to_string();
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = floor_char_boundary(s, max);
    s[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_colors_and_osc() {
        assert_eq!(strip_ansi("\x1b[32mHOMER_DONE\x1b[0m"), "HOMER_DONE");
        assert_eq!(strip_ansi("\x1b]0;title\x07plain"), "plain");
        assert_eq!(strip_ansi("line\r\n"), "line\n");
    }

    #[test]
    fn test_done_signal_through_ansi() {
        let mut buf = OutputBuffer::new();
        buf.append(b"working on it...\n\x1b[32mHOMER_DONE\x1b[0m\n");
        assert_eq!(buf.scan_signal(), Some(Signal::Done));
    }

    #[test]
    fn test_blocked_signal_with_reason() {
        let mut buf = OutputBuffer::new();
        buf.append(b"HOMER_BLOCKED : missing API key\n");
        assert_eq!(
            buf.scan_signal(),
            Some(Signal::Blocked {
                reason: "missing API key".into()
            })
        );
    }

    #[test]
    fn test_blocked_signal_without_reason_is_unknown() {
        let mut buf = OutputBuffer::new();
        buf.append(b"HOMER_BLOCKED\n");
        assert_eq!(
            buf.scan_signal(),
            Some(Signal::Blocked {
                reason: "unknown".into()
            })
        );
    }

    #[test]
    fn test_earliest_signal_wins() {
        let mut buf = OutputBuffer::new();
        buf.append(b"HOMER_BLOCKED : stuck\nHOMER_DONE\n");
        assert!(matches!(buf.scan_signal(), Some(Signal::Blocked { .. })));
    }

    #[test]
    fn test_no_signal_until_rearm() {
        let mut buf = OutputBuffer::new();
        buf.append(b"HOMER_DONE\n");
        assert_eq!(buf.scan_signal(), Some(Signal::Done));
        buf.append(b"HOMER_DONE\n");
        assert_eq!(buf.scan_signal(), None);
        buf.rearm();
        assert_eq!(buf.scan_signal(), Some(Signal::Done));
    }

    #[test]
    fn test_instruction_echo_does_not_trigger() {
        let mut buf = OutputBuffer::new();
        buf.append(b"> please print HOMER_DONE when you are finished\n");
        assert_eq!(buf.scan_signal(), None);
        // But the agent actually printing it on its own line does.
        buf.append(b"HOMER_DONE\n");
        assert_eq!(buf.scan_signal(), Some(Signal::Done));
    }

    #[test]
    fn test_signal_outside_window_is_ignored() {
        let mut buf = OutputBuffer::new();
        buf.append(b"HOMER_DONE\n");
        let padding = "x".repeat(600);
        buf.append(padding.as_bytes());
        assert_eq!(buf.scan_signal(), None);
    }

    #[test]
    fn test_trim_keeps_tail_and_extracts() {
        let mut buf = OutputBuffer::new();
        buf.set_verify_digest("[verify history: attempt 1 failed typecheck]\n".to_string());

        let mut chunk = String::new();
        chunk.push_str("My plan is to refactor the auth module first.\n");
        chunk.push_str("editing src/auth/login.ts now\n");
        chunk.push_str("Error: cannot find module './session' in resolver\n");
        // Pad past TRIM_AT so the interesting prefix is discarded.
        chunk.push_str(&"y".repeat(TRIM_AT + 1024));
        let extract = buf.append(chunk.as_bytes()).expect("trim should run");

        assert!(extract.file_paths.contains(&"src/auth/login.ts".to_string()));
        assert!(extract.errors.iter().any(|e| e.contains("cannot find module")));
        assert!(extract.approach_note.as_deref().unwrap().contains("plan"));

        assert!(buf.len() <= KEEP + 128);
        assert!(buf.contents().starts_with("[verify history"));
    }

    #[test]
    fn test_trim_never_drops_signal_bearing_tail() {
        let mut buf = OutputBuffer::new();
        let mut chunk = "z".repeat(TRIM_AT + 10);
        chunk.push_str("\nHOMER_DONE\n");
        buf.append(chunk.as_bytes());
        assert_eq!(buf.scan_signal(), Some(Signal::Done));
    }

    #[test]
    fn test_extract_file_paths_dedup() {
        let text = "touched src/a.ts then src/a.ts and lib/b.rs plus vendor/x.c";
        let paths = extract_file_paths(text, 10);
        assert_eq!(paths, vec!["src/a.ts".to_string(), "lib/b.rs".to_string()]);
    }

    #[test]
    fn test_tail_lines_stripped() {
        let mut buf = OutputBuffer::new();
        buf.append(b"\x1b[1mone\x1b[0m\n\ntwo\nthree\n");
        assert_eq!(buf.tail_lines_stripped(2), vec!["two", "three"]);
        assert_eq!(buf.last_line_stripped(), "three");
    }
}
