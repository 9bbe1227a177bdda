use crate::error::SaveError;
use crate::parser::parse_iptables_save_async;
use ipx_core::{CollectorConfig, Tables};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;

/// Runs the save binary and parses its output while it is being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveCommand {
    program: String,
    args: Vec<String>,
}

impl SaveCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run one collection cycle.
    ///
    /// A read failure kills the process and is returned as is. Otherwise a
    /// non-zero exit wins over a parse failure, since a truncated dump is
    /// most likely a symptom of the failed process.
    pub async fn collect(&self) -> Result<Tables, SaveError> {
        tracing::debug!(command = %self.program, args = ?self.args, "running save command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::error!(command = %self.program, err = %source, "failed to start save command");
                SaveError::Spawn {
                    command: self.program.clone(),
                    source,
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SaveError::Read(std::io::Error::other("stdout was not captured")))?;

        // drain stderr on its own task so a chatty process cannot block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let parsed = parse_iptables_save_async(BufReader::new(stdout)).await;
        if matches!(parsed, Err(SaveError::Read(_))) {
            // nobody reads the pipe anymore; the kill status says nothing
            // about the process, so the read error is what gets reported
            let _ = child.start_kill();
            let _ = child.wait().await;
            return parsed;
        }

        let status = child.wait().await.map_err(|source| {
            tracing::error!(command = %self.program, err = %source, "failed to wait for save command");
            SaveError::Wait {
                command: self.program.clone(),
                source,
            }
        })?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let stderr = stderr.trim().to_string();
            tracing::error!(
                command = %self.program,
                status = %status,
                stderr = %stderr,
                "save command encountered failure"
            );
            return Err(SaveError::Exit {
                command: self.program.clone(),
                status,
                stderr,
            });
        }

        parsed
    }
}

impl Default for SaveCommand {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default())
    }
}
