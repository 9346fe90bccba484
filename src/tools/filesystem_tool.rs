use crate::error::AppError;
use crate::tools::command_router::BUILTIN_COMMANDS;
use crate::utils::path_utils::resolve_against;
use serde::Serialize;
use std::path::{is_separator, Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

pub const MAX_SUGGESTIONS: usize = 10;

/// External programs offered when completing the first word of a command.
pub const COMMON_COMMANDS: &[&str] = &[
    "ls", "cat", "grep", "find", "git", "npm", "node", "python", "python3", "pip", "cargo", "docker",
    "kubectl", "make", "mkdir", "rm", "cp", "mv", "touch", "chmod", "curl", "wget", "tar", "ssh",
    "vim", "nano", "top", "ps", "kill", "which",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Directory,
    File,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Follows symlinks. Anything that cannot be stat'ed counts as missing.
pub async fn stat(path: &Path) -> PathKind {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => PathKind::Directory,
        Ok(_) => PathKind::File,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "stat failed");
            PathKind::Missing
        }
    }
}

/// Resolves `target` against `cwd` and checks that it names a directory.
pub async fn resolve_directory(cwd: &Path, target: &str) -> Result<PathBuf, AppError> {
    let resolved = resolve_against(cwd, target);
    match stat(&resolved).await {
        PathKind::Directory => Ok(resolved),
        PathKind::File => Err(AppError::NotADirectory(resolved)),
        PathKind::Missing => Err(AppError::PathNotFound(resolved)),
    }
}

pub async fn list_directory(dir: &Path) -> Result<Vec<DirectoryEntry>, AppError> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = fs::metadata(entry.path()).await.map(|m| m.is_dir()).unwrap_or(false);
        entries.push(DirectoryEntry { name, is_dir });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn command_suggestions(prefix: &str) -> impl Iterator<Item = String> + '_ {
    BUILTIN_COMMANDS
        .iter()
        .chain(COMMON_COMMANDS.iter())
        .filter(move |cmd| cmd.starts_with(prefix))
        .map(|cmd| cmd.to_string())
}

async fn path_suggestions(cwd: &Path, token: &str) -> Vec<String> {
    let (dir_part, base) = match token.rfind(is_separator) {
        Some(i) => token.split_at(i + 1),
        None => ("", token),
    };
    let dir = if dir_part.is_empty() {
        cwd.to_path_buf()
    } else {
        resolve_against(cwd, dir_part)
    };

    let entries = match list_directory(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot list directory for completion");
            return Vec::new();
        }
    };

    let show_hidden = base.starts_with('.');
    entries
        .into_iter()
        .filter(|entry| entry.name.starts_with(base))
        .filter(|entry| show_hidden || !entry.name.starts_with('.'))
        .map(|entry| {
            let sep = if entry.is_dir { "/" } else { "" };
            format!("{}{}{}", dir_part, entry.name, sep)
        })
        .collect()
}

/// Suggestions for the word being typed at the end of `partial`.
///
/// The first word, when it has no path separator, is completed from the
/// built-ins and common programs and then from entries of `cwd`. Any other
/// word is completed as a path relative to `cwd`, keeping the directory part
/// the user typed. Never more than [`MAX_SUGGESTIONS`]; unreadable
/// directories give no suggestions.
#[instrument(skip(cwd), fields(cwd = %cwd.display()))]
pub async fn complete(cwd: &Path, partial: &str) -> Vec<String> {
    let ends_with_space = partial.ends_with(char::is_whitespace);
    let tokens: Vec<&str> = partial.split_whitespace().collect();
    let last = if ends_with_space {
        ""
    } else {
        tokens.last().copied().unwrap_or("")
    };
    let is_first_word = tokens.len() <= 1 && !ends_with_space;

    let mut suggestions: Vec<String> = Vec::new();
    if is_first_word && !last.contains(is_separator) {
        suggestions.extend(command_suggestions(last));
    }
    if suggestions.len() < MAX_SUGGESTIONS {
        for candidate in path_suggestions(cwd, last).await {
            if !suggestions.contains(&candidate) {
                suggestions.push(candidate);
            }
        }
    }
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}
