//! Filesystem layout under `~/.homer` and inside the working repository.
//!
//! All persistence that must look atomic to readers goes through
//! [`write_atomic`] (temp-write then rename).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Resolved per-repository paths.
#[derive(Debug, Clone)]
pub struct HomerPaths {
    /// `~/.homer`
    pub root: PathBuf,
    /// Slug derived from the repo name or cwd
    pub repo_slug: String,
    /// `~/.homer/context/{slug}`
    pub context_dir: PathBuf,
    /// The user repository root
    pub cwd: PathBuf,
}

impl HomerPaths {
    pub fn new(repo: &str, cwd: &Path) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
        let root = home.join(".homer");
        let repo_slug = repo_slug(repo, cwd);
        let context_dir = root.join("context").join(&repo_slug);
        Ok(Self {
            root,
            repo_slug,
            context_dir,
            cwd: cwd.to_path_buf(),
        })
    }

    /// Create the directories this run writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("sessions"))?;
        fs::create_dir_all(self.agent_notes_dir())?;
        Ok(())
    }

    pub fn session_file(&self) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{}.json", self.repo_slug))
    }

    pub fn memory_db(&self) -> PathBuf {
        self.context_dir.join("memory.db")
    }

    pub fn agent_notes_dir(&self) -> PathBuf {
        self.context_dir.join("agent-notes")
    }

    pub fn agent_note(&self, agent_id: &str) -> PathBuf {
        self.agent_notes_dir().join(format!("{}.md", agent_id))
    }

    pub fn shared_notes(&self) -> PathBuf {
        self.context_dir.join("shared.md")
    }

    pub fn workflows_log(&self) -> PathBuf {
        self.context_dir.join("workflows.log")
    }

    pub fn progress_log(&self) -> PathBuf {
        self.context_dir.join("progress.txt")
    }

    /// Auto-generated context file inside the working repository.
    pub fn repo_context_file(&self) -> PathBuf {
        self.cwd.join(".homer").join("context.md")
    }
}

/// Derive the repo slug: `"owner/name"` becomes `"owner-name"` lowercased.
/// An empty repo falls back to `"local-<last-two-cwd-segments>"` with
/// non-alphanumerics stripped.
pub fn repo_slug(repo: &str, cwd: &Path) -> String {
    if !repo.trim().is_empty() {
        return repo.trim().replace('/', "-").to_lowercase();
    }
    let segments: Vec<String> = cwd
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    let tail = segments
        .iter()
        .rev()
        .take(2)
        .rev()
        .map(|s| {
            s.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("-");
    format!("local-{}", tail)
}

/// Write a file atomically from the reader's perspective: write to a
/// sibling temp file, flush, then rename over the target.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Append a single line to a log file, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug_from_owner_name() {
        let cwd = PathBuf::from("/tmp/whatever");
        assert_eq!(repo_slug("Acme/My-Repo", &cwd), "acme-my-repo");
        assert_eq!(repo_slug("owner/name", &cwd), "owner-name");
    }

    #[test]
    fn test_repo_slug_local_fallback() {
        let cwd = PathBuf::from("/home/dev/My Projects/web_app");
        let slug = repo_slug("", &cwd);
        assert_eq!(slug, "local-myprojects-webapp");
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("state.json");

        write_atomic(&target, "{\"v\":1}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"v\":1}");

        write_atomic(&target, "{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"v\":2}");
        // no temp file left behind
        assert!(!target.with_extension("tmp").exists());
    }

    #[test]
    fn test_append_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("workflows.log");
        append_line(&log, "one").unwrap();
        append_line(&log, "two").unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "one\ntwo\n");
    }
}
