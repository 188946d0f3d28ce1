//! Verification runner - detects and executes the project's own checks.
//!
//! Detection is deterministic and runs before anything is executed; the
//! runner itself is pure: the same project state and command list yield the
//! same result modulo the subprocess determinism of those commands.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::output::FILE_PATH_RE;

/// Hard per-command timeout.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(120);

const PASS_TAIL: usize = 500;
const FAIL_TAIL: usize = 800;

/// A detected check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckCommand {
    pub name: String,
    pub command: String,
}

impl CheckCommand {
    fn new(name: &str, command: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            command: command.into(),
        }
    }
}

/// Result of one executed check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub name: String,
    pub command: String,
    pub passed: bool,
    /// Output tail: last 500 chars on pass, 800 on fail.
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_key: Option<String>,
}

/// Aggregate verification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub passed: bool,
    pub skipped: bool,
    pub results: Vec<CheckOutcome>,
}

impl VerifyResult {
    pub fn skipped() -> Self {
        Self {
            passed: true,
            skipped: true,
            results: Vec::new(),
        }
    }

    pub fn failed_checks(&self) -> Vec<&CheckOutcome> {
        self.results.iter().filter(|r| !r.passed).collect()
    }
}

// ============ Detection ============

/// Detect the project's verify commands. Inspection order: package.json
/// scripts (typecheck, lint, test, build fallback), tsconfig synthesis,
/// Python tooling, then a Makefile `check:` target as last resort.
pub fn detect_commands(root: &Path) -> Vec<CheckCommand> {
    let mut commands = Vec::new();

    let scripts = read_package_scripts(root);
    let mut js_checks = 0usize;
    if scripts.contains_key("typecheck") {
        commands.push(CheckCommand::new("typecheck", "npm run typecheck"));
        js_checks += 1;
    } else if scripts.contains_key("type-check") {
        commands.push(CheckCommand::new("typecheck", "npm run type-check"));
        js_checks += 1;
    } else if root.join("tsconfig.json").is_file() {
        commands.push(CheckCommand::new("typecheck", "npx tsc --noEmit"));
        js_checks += 1;
    }
    if scripts.contains_key("lint") {
        commands.push(CheckCommand::new("lint", "npm run lint"));
        js_checks += 1;
    }
    if let Some(test) = scripts.get("test") {
        if !is_stock_test_stub(test) {
            commands.push(CheckCommand::new("test", "npm test"));
            js_checks += 1;
        }
    }
    if js_checks == 0 && scripts.contains_key("build") {
        commands.push(CheckCommand::new("build", "npm run build"));
    }

    if has_mypy_config(root) {
        commands.push(CheckCommand::new("mypy", "mypy ."));
    }
    if root.join("tests").is_dir() || root.join("test").is_dir() {
        commands.push(CheckCommand::new("pytest", "pytest"));
    }
    if has_ruff_config(root) {
        commands.push(CheckCommand::new("ruff", "ruff check ."));
    }

    if commands.is_empty() && makefile_has_check_target(root) {
        commands.push(CheckCommand::new("check", "make check"));
    }

    debug!(count = commands.len(), "verify commands detected");
    commands
}

fn read_package_scripts(root: &Path) -> serde_json::Map<String, serde_json::Value> {
    let Ok(raw) = std::fs::read_to_string(root.join("package.json")) else {
        return serde_json::Map::new();
    };
    let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return serde_json::Map::new();
    };
    pkg.get("scripts")
        .and_then(|s| s.as_object())
        .cloned()
        .unwrap_or_default()
}

fn is_stock_test_stub(script: &serde_json::Value) -> bool {
    script
        .as_str()
        .map(|s| s.contains("no test specified"))
        .unwrap_or(false)
}

fn has_mypy_config(root: &Path) -> bool {
    if root.join("mypy.ini").is_file() || root.join(".mypy.ini").is_file() {
        return true;
    }
    file_contains(root.join("setup.cfg"), "[mypy]")
        || file_contains(root.join("pyproject.toml"), "[tool.mypy]")
}

fn has_ruff_config(root: &Path) -> bool {
    if root.join("ruff.toml").is_file() || root.join(".ruff.toml").is_file() {
        return true;
    }
    file_contains(root.join("pyproject.toml"), "[tool.ruff]")
}

fn file_contains(path: std::path::PathBuf, needle: &str) -> bool {
    std::fs::read_to_string(path)
        .map(|s| s.contains(needle))
        .unwrap_or(false)
}

static MAKE_CHECK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^check:").unwrap());

fn makefile_has_check_target(root: &Path) -> bool {
    std::fs::read_to_string(root.join("Makefile"))
        .map(|s| MAKE_CHECK_RE.is_match(&s))
        .unwrap_or(false)
}

// ============ Execution ============

/// Run every detected check with the hard timeout, stdin closed and
/// captured output. Returns a skipped pass when no commands were detected.
pub async fn run_checks(root: &Path, commands: &[CheckCommand]) -> VerifyResult {
    if commands.is_empty() {
        return VerifyResult::skipped();
    }

    let mut results = Vec::with_capacity(commands.len());
    for check in commands {
        results.push(run_one(root, check).await);
    }
    let passed = results.iter().all(|r| r.passed);
    VerifyResult {
        passed,
        skipped: false,
        results,
    }
}

async fn run_one(root: &Path, check: &CheckCommand) -> CheckOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(CHECK_TIMEOUT, child).await {
        Ok(Ok(out)) => {
            let passed = out.status.success();
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let combined = if !stderr.trim().is_empty() {
                stderr.into_owned()
            } else if !stdout.trim().is_empty() {
                stdout.into_owned()
            } else {
                format!("exit status {}", out.status)
            };
            let output = tail(&combined, if passed { PASS_TAIL } else { FAIL_TAIL });
            let error_key = if passed {
                None
            } else {
                Some(extract_error_key(&check.name, &combined))
            };
            CheckOutcome {
                name: check.name.clone(),
                command: check.command.clone(),
                passed,
                output,
                error_key,
            }
        }
        Ok(Err(e)) => CheckOutcome {
            name: check.name.clone(),
            command: check.command.clone(),
            passed: false,
            output: tail(&format!("failed to run: {}", e), FAIL_TAIL),
            error_key: Some(format!("{}:unknown", check.name)),
        },
        Err(_) => {
            warn!(check = %check.name, "verification check timed out");
            CheckOutcome {
                name: check.name.clone(),
                command: check.command.clone(),
                passed: false,
                output: format!("timed out after {}s", CHECK_TIMEOUT.as_secs()),
                error_key: Some(format!("{}:unknown", check.name)),
            }
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = s.len() - max;
    while cut < s.len() && !s.is_char_boundary(cut) {
        cut += 1;
    }
    s[cut..].to_string()
}

// ============ Error keys ============

static TS_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"TS(\d{4,5})").unwrap());
static TEST_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\w./-]*[\w-]+\.(?:test|spec)\.[jt]sx?)").unwrap());
static TEST_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:✗|✕|FAIL|×|failing)\s+(.+)").unwrap());
static LINT_RULE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:error|warning)\s+(@?[a-z][a-z0-9-]*(?:/[a-z0-9-]+)*)\b").unwrap());

/// Synthesize the normalized error key the memory store joins on.
///
/// Normalization order: TypeScript codes, failing test files, lint rules,
/// then a `<check>:<file>` / `<check>:unknown` fallback.
pub fn extract_error_key(check: &str, output: &str) -> String {
    if let Some(caps) = TS_CODE_RE.captures(output) {
        let mut key = format!("typecheck:TS{}", &caps[1]);
        if let Some(file) = first_file_path(output) {
            key.push(':');
            key.push_str(&file);
        }
        return key;
    }

    if let Some(caps) = TEST_FILE_RE.captures(output) {
        let filename = caps[1]
            .rsplit('/')
            .next()
            .unwrap_or(&caps[1])
            .to_string();
        let mut key = format!("test:{}", filename);
        if let Some(name) = normalized_test_name(output) {
            key.push(':');
            key.push_str(&name);
        }
        return key;
    }

    if let Some(caps) = LINT_RULE_RE.captures(output) {
        let mut key = format!("lint:{}", &caps[1]);
        if let Some(file) = first_file_path(output) {
            key.push(':');
            key.push_str(&file);
        }
        return key;
    }

    match first_file_path(output) {
        Some(file) => format!("{}:{}", check, file),
        None => format!("{}:unknown", check),
    }
}

fn first_file_path(output: &str) -> Option<String> {
    FILE_PATH_RE
        .captures(output)
        .map(|caps| caps[2].to_string())
}

/// 10-40 chars of the failing test name, spaces folded to underscores.
/// Captures that are themselves file paths (the `FAIL <file>` line) are
/// skipped in favor of the actual test title.
fn normalized_test_name(output: &str) -> Option<String> {
    for caps in TEST_NAME_RE.captures_iter(output) {
        let raw = caps[1].trim();
        if raw.len() < 10 || TEST_FILE_RE.is_match(raw) {
            continue;
        }
        let mut cut = raw.len().min(40);
        while cut > 0 && !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        return Some(raw[..cut].trim().replace(' ', "_"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_detect_explicit_typecheck_script() {
        let dir = project(&[(
            "package.json",
            r#"{"scripts":{"typecheck":"tsc --noEmit","lint":"eslint ."}}"#,
        )]);
        let cmds = detect_commands(dir.path());
        assert_eq!(cmds[0], CheckCommand::new("typecheck", "npm run typecheck"));
        assert_eq!(cmds[1], CheckCommand::new("lint", "npm run lint"));
    }

    #[test]
    fn test_detect_synthesized_tsc() {
        let dir = project(&[("package.json", r#"{"scripts":{}}"#), ("tsconfig.json", "{}")]);
        let cmds = detect_commands(dir.path());
        assert_eq!(cmds, vec![CheckCommand::new("typecheck", "npx tsc --noEmit")]);
    }

    #[test]
    fn test_detect_skips_stock_test_stub() {
        let dir = project(&[(
            "package.json",
            r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#,
        )]);
        assert!(detect_commands(dir.path()).is_empty());
    }

    #[test]
    fn test_detect_build_fallback() {
        let dir = project(&[("package.json", r#"{"scripts":{"build":"webpack"}}"#)]);
        let cmds = detect_commands(dir.path());
        assert_eq!(cmds, vec![CheckCommand::new("build", "npm run build")]);
    }

    #[test]
    fn test_detect_python_checks() {
        let dir = project(&[
            ("mypy.ini", "[mypy]\n"),
            ("pyproject.toml", "[tool.ruff]\nline-length = 100\n"),
            ("tests/test_app.py", "def test_ok(): pass\n"),
        ]);
        let cmds = detect_commands(dir.path());
        let names: Vec<_> = cmds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["mypy", "pytest", "ruff"]);
    }

    #[test]
    fn test_detect_makefile_last_resort() {
        let dir = project(&[("Makefile", "check:\n\tcargo test\n")]);
        let cmds = detect_commands(dir.path());
        assert_eq!(cmds, vec![CheckCommand::new("check", "make check")]);
    }

    #[test]
    fn test_error_key_typescript_code_with_file() {
        let out = "src/auth/login.ts:12:3 - error TS2322: Type 'string' is not assignable";
        assert_eq!(
            extract_error_key("typecheck", out),
            "typecheck:TS2322:src/auth/login.ts"
        );
    }

    #[test]
    fn test_error_key_test_file_with_name() {
        let out = "FAIL tests/auth.test.ts\n  ✗ rejects expired session tokens cleanly";
        let key = extract_error_key("test", out);
        assert!(key.starts_with("test:auth.test.ts:"), "key was {}", key);
        assert!(key.contains("rejects_expired_session"));
    }

    #[test]
    fn test_error_key_lint_rule() {
        let out = "src/app/main.tsx\n  10:5  error no-unused-vars  'x' is assigned";
        assert_eq!(
            extract_error_key("lint", out),
            "lint:no-unused-vars:src/app/main.tsx"
        );
    }

    #[test]
    fn test_error_key_fallback_unknown() {
        assert_eq!(extract_error_key("build", "something exploded"), "build:unknown");
    }

    #[test]
    fn test_error_key_fallback_with_file() {
        let out = "compile failed in src/index.ts somewhere";
        assert_eq!(extract_error_key("build", out), "build:src/index.ts");
    }

    #[tokio::test]
    async fn test_run_checks_skipped_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_checks(dir.path(), &[]).await;
        assert!(result.passed);
        assert!(result.skipped);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn test_run_checks_pass_and_fail() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            CheckCommand::new("ok", "echo fine"),
            CheckCommand::new("bad", "echo 'Error: everything is broken here' >&2; exit 1"),
        ];
        let result = run_checks(dir.path(), &commands).await;
        assert!(!result.passed);
        assert!(!result.skipped);
        assert!(result.results[0].passed);
        assert!(!result.results[1].passed);
        assert_eq!(result.results[1].error_key.as_deref(), Some("bad:unknown"));
        assert!(result.results[1].output.contains("everything is broken"));
    }

    #[test]
    fn test_output_tail_truncation() {
        let long = "a".repeat(2000);
        assert_eq!(tail(&long, 800).len(), 800);
        assert_eq!(tail("short", 800), "short");
    }
}
