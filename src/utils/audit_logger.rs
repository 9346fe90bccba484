use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tracing::error;

/// Append-only log of every command forwarded to a shell, rotated by size.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
    write_lock: TokioMutex<()>, // serializes rotate + append across sessions
}

impl AuditLogger {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        // Ensure log directory exists
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
            write_lock: TokioMutex::new(()),
        }
    }

    /// `None` unless `COMMAND_AUDIT_LOG` is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .command_audit_log
            .as_ref()
            .map(|path| Self::new(path.clone(), config.audit_log_max_size_bytes))
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let backup_file_name = match self.log_file_path.extension() {
                Some(ext) => format!("{}_{}.{}", file_stem, timestamp, ext.to_string_lossy()),
                None => format!("{}_{}", file_stem, timestamp),
            };
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Failures are logged and swallowed; auditing never fails a command.
    pub async fn log_command(&self, session_id: &str, cwd: &Path, command: &str) {
        if let Err(e) = self.try_log_command(session_id, cwd, command).await {
            error!(sid = %session_id, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_command(&self, session_id: &str, cwd: &Path, command: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        // JSON-quoted so embedded newlines cannot forge entries
        let command_json = serde_json::to_string(command)?;
        let log_entry = format!(
            "{} | {:<36} | {} | {}\n",
            timestamp,
            session_id,
            cwd.display(),
            command_json
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_one_line_per_command() {
        let tmp = tempdir().unwrap();
        let logger = AuditLogger::new(tmp.path().join("audit").join("commands.log"), 1024 * 1024);

        logger.log_command("s1", Path::new("/home/u"), "ls -la").await;
        logger.log_command("s1", Path::new("/tmp"), "printf 'a\\nb'").await;

        let content = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("| /home/u | \"ls -la\""));
        assert!(lines[1].contains("/tmp"));
    }

    #[tokio::test]
    async fn rotates_when_size_limit_reached() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("commands.log");
        let logger = AuditLogger::new(path.clone(), 10);

        logger.log_command("s1", Path::new("/"), "first").await;
        logger.log_command("s1", Path::new("/"), "second").await;

        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("second"));
        assert!(!current.contains("first"));
        let files = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn disabled_without_configured_path() {
        let config = Config::default();
        assert!(AuditLogger::from_config(&config).is_none());

        let tmp = tempdir().unwrap();
        let path = tmp.path().join("commands.log");
        let config = Config {
            command_audit_log: Some(path.clone()),
            ..Config::default()
        };
        let logger = AuditLogger::from_config(&config).unwrap();
        assert_eq!(logger.path(), path.as_path());
    }
}
