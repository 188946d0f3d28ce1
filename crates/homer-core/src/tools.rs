//! Tool catalog - descriptors for the supported AI coding CLIs.
//!
//! The catalog is process-wide and immutable for the run. A tool the
//! catalog does not know, but which resolves to an executable on PATH,
//! becomes a [`ToolKind::Generic`] descriptor with no capabilities.

use std::path::Path;

use serde::Serialize;

/// Which family of CLI this descriptor drives. Controls argument building
/// and prompt delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Claude,
    Aider,
    Generic,
}

/// Capability flags advertised by a tool.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCapabilities {
    pub interactive: bool,
    pub permission_modes: bool,
    pub supports_system_prompt: bool,
    pub supports_initial_prompt: bool,
}

/// Options fed to the argument builders.
#[derive(Debug, Clone, Default)]
pub struct ToolSpawnOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
}

/// One entry of the tool catalog.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub command: String,
    pub kind: ToolKind,
    pub capabilities: ToolCapabilities,
    /// Environment variable that must be present for this tool to work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_env: Option<String>,
}

impl ToolDescriptor {
    /// Build the command line arguments for an interactive spawn.
    pub fn build_args(&self, opts: &ToolSpawnOptions) -> Vec<String> {
        let mut args = Vec::new();
        match self.kind {
            ToolKind::Claude => {
                if let Some(ref model) = opts.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if let Some(ref mode) = opts.permission_mode {
                    args.push("--permission-mode".to_string());
                    args.push(mode.clone());
                }
                if let Some(ref sys) = opts.system_prompt {
                    args.push("--append-system-prompt".to_string());
                    args.push(sys.clone());
                }
            }
            ToolKind::Aider => {
                if let Some(ref model) = opts.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args.push("--no-auto-commits".to_string());
            }
            ToolKind::Generic => {}
        }
        args
    }

    /// Arguments that deliver the initial prompt, for tools that accept it
    /// on the command line. `None` means the prompt must be written to the
    /// PTY once the child is ready.
    pub fn initial_prompt_args(&self, prompt: &str) -> Option<Vec<String>> {
        if !self.capabilities.supports_initial_prompt {
            return None;
        }
        match self.kind {
            ToolKind::Claude => Some(vec![prompt.to_string()]),
            _ => None,
        }
    }
}

/// The built-in catalog. Order matters: [`default_tool`] picks the first
/// entry whose command resolves on PATH.
pub fn catalog() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            id: "claude".to_string(),
            name: "Claude Code".to_string(),
            command: "claude".to_string(),
            kind: ToolKind::Claude,
            capabilities: ToolCapabilities {
                interactive: true,
                permission_modes: true,
                supports_system_prompt: true,
                supports_initial_prompt: true,
            },
            required_env: None,
        },
        ToolDescriptor {
            id: "aider".to_string(),
            name: "Aider".to_string(),
            command: "aider".to_string(),
            kind: ToolKind::Aider,
            capabilities: ToolCapabilities {
                interactive: true,
                permission_modes: false,
                supports_system_prompt: false,
                supports_initial_prompt: false,
            },
            required_env: Some("OPENAI_API_KEY".to_string()),
        },
    ]
}

/// Resolve a tool id or bare command. Known ids resolve from the catalog;
/// an unknown name that is executable on PATH becomes a generic
/// no-capability descriptor; anything else is `None`.
pub fn resolve(id: &str) -> Option<ToolDescriptor> {
    if let Some(tool) = catalog().into_iter().find(|t| t.id == id) {
        if which(&tool.command) {
            return Some(tool);
        }
        return None;
    }
    if which(id) {
        return Some(ToolDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            command: id.to_string(),
            kind: ToolKind::Generic,
            capabilities: ToolCapabilities {
                interactive: true,
                permission_modes: false,
                supports_system_prompt: false,
                supports_initial_prompt: false,
            },
            required_env: None,
        });
    }
    None
}

/// First catalog tool present on PATH.
pub fn default_tool() -> Option<ToolDescriptor> {
    catalog().into_iter().find(|t| which(&t.command))
}

/// Minimal PATH lookup; absolute/relative paths are checked directly.
fn which(cmd: &str) -> bool {
    if cmd.contains('/') {
        return is_executable(Path::new(cmd));
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| is_executable(&dir.join(cmd)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
