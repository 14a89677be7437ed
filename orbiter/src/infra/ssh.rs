//! SSH transport, driving the system `ssh` client.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Connector, Remote};
use crate::error::{Error, Result};

/// Remote host reachable as `user@ip` with one of the given private keys.
pub struct SshRemote {
    user: String,
    ip: String,
    /// Key files must outlive every ssh invocation.
    keys: Vec<Arc<NamedTempFile>>,
}

impl std::fmt::Debug for SshRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshRemote")
            .field("user", &self.user)
            .field("ip", &self.ip)
            .finish()
    }
}

impl SshRemote {
    pub fn new(user: &str, ip: &str, private_keys: &[String]) -> Result<Self> {
        let mut keys = Vec::with_capacity(private_keys.len());
        for key in private_keys {
            keys.push(Arc::new(write_key(key)?));
        }
        Ok(Self {
            user: user.to_string(),
            ip: ip.to_string(),
            keys,
        })
    }

    fn command(&self, tty: bool) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "LogLevel=ERROR",
        ]);
        if !tty {
            cmd.args(["-o", "BatchMode=yes"]);
        } else {
            cmd.arg("-t");
        }
        for key in &self.keys {
            cmd.arg("-i").arg(key.path());
        }
        cmd.arg(format!("{}@{}", self.user, self.ip));
        cmd
    }
}

fn write_key(key: &str) -> Result<NamedTempFile> {
    use std::io::Write;
    let mut file = NamedTempFile::new()?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

#[async_trait]
impl Remote for SshRemote {
    async fn execute(&self, stdin: Option<&[u8]>, cmd: &str) -> Result<Vec<u8>> {
        debug!(host = %self.ip, cmd, "Executing");
        let mut child = self
            .command(false)
            .arg(cmd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| Error::remote("ssh stdin not captured"))?;
            pipe.write_all(input).await?;
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                cmd: cmd.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn shell(&self) -> Result<()> {
        let status = self
            .command(true)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Command {
                cmd: "shell".to_string(),
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.execute(None, &format!("sudo cat {}", quote(path))).await
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        let dir = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => "/",
        };
        let (dir, path) = (quote(dir), quote(path));
        self.execute(
            Some(content),
            &format!(
                "sudo mkdir -p {dir} && sudo tee {path} > /dev/null && sudo chmod {mode:o} {path}"
            ),
        )
        .await
        .map(|_| ())
    }
}

/// Quotes `arg` for the remote shell.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Connects to hosts with [`SshRemote`].
#[derive(Debug, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, user: &str, ip: &str, private_keys: &[String]) -> Result<Arc<dyn Remote>> {
        Ok(Arc::new(SshRemote::new(user, ip, private_keys)?))
    }
}

/// Generates an ed25519 key pair with `ssh-keygen`. Returns `(private, public)`.
pub async fn generate_keypair() -> Result<(String, String)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("key");
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", "orbiter", "-f"])
        .arg(&path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Command {
            cmd: "ssh-keygen".to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let private = tokio::fs::read_to_string(&path).await?;
    let public = tokio::fs::read_to_string(path.with_extension("pub")).await?;
    Ok((private, public.trim().to_string()))
}
