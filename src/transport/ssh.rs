//! Transport implementation over the OpenSSH client.
//!
//! One control master is established per session and every subsequent
//! command is multiplexed over it, so the device sees a single authenticated
//! connection. Authentication is key/agent based with a fixed username and no
//! password, per the device's convention.

use super::{CommandOutput, Transport, TransportError};

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// An established SSH session to the remote device.
///
/// The control master is torn down in `Drop`, so the session is released on
/// every exit path, including aborts.
#[derive(Debug)]
pub struct SshTransport {
    host: String,
    username: String,
    control_path: PathBuf,
}

impl SshTransport {
    /// Connect to `host`, establishing the control master.
    pub fn connect(host: &str, username: &str) -> Result<Self, TransportError> {
        let control_path =
            std::env::temp_dir().join(format!("bos-restore-{}-{host}.sock", std::process::id()));

        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .args(["-M", "-N", "-f"])
            .arg("-S")
            .arg(&control_path)
            .arg("-l")
            .arg(username)
            .arg(host)
            .output()
            .map_err(|e| TransportError::Connect {
                host: host.to_string(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TransportError::Connect {
                host: host.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Self {
            host: host.to_string(),
            username: username.to_string(),
            control_path,
        })
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-S")
            .arg(&self.control_path)
            .arg("-l")
            .arg(&self.username)
            .arg(&self.host)
            .arg(remote);
        cmd
    }
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

fn failure_detail(status: std::process::ExitStatus, stderr: &[String]) -> String {
    match stderr.last() {
        Some(line) => line.clone(),
        None => status.to_string(),
    }
}

impl Transport for SshTransport {
    fn run(&mut self, cmd: &[&str]) -> Result<CommandOutput, TransportError> {
        let remote = cmd.join(" ");
        let output = self.command(&remote).stdin(Stdio::null()).output()?;

        let stdout = lines(&output.stdout);
        let stderr = lines(&output.stderr);
        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                cmd: remote,
                detail: failure_detail(output.status, &stderr),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    fn pipe(&mut self, cmd: &[&str], input: &mut dyn Read) -> Result<(), TransportError> {
        let remote = cmd.join(" ");
        let mut child = self
            .command(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        {
            let mut stdin = child.stdin.take().expect("stdin is piped");
            io::copy(input, &mut stdin)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = lines(&output.stderr);
            return Err(TransportError::CommandFailed {
                cmd: remote,
                detail: failure_detail(output.status, &stderr),
            });
        }

        Ok(())
    }

    fn put(&mut self, source: &Path, dest: &str) -> Result<(), TransportError> {
        // BusyBox targets do not reliably ship an sftp server; stream the
        // file through the remote shell instead.
        let mut file = std::fs::File::open(source)?;
        self.pipe(&["sh", "-c", &format!("'cat > {dest}'")], &mut file)
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        let _ = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg("-l")
            .arg(&self.username)
            .arg(&self.host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
