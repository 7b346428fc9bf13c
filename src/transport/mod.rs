//! Abstractions and code to reach the remote device.
//!
//! The orchestrator never talks to a concrete session type; everything goes
//! through [`Transport`], so the restoration logic can be exercised against
//! an in-memory fake that records issued commands without touching real
//! hardware.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod ssh;

/// A transport-layer failure. Always fatal: the restoration never retries.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot connect to {host}: {detail}")]
    Connect { host: String, detail: String },

    #[error("remote command `{cmd}` failed: {detail}")]
    CommandFailed { cmd: String, detail: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Line-oriented output of a successfully executed remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// One authenticated session to the remote device.
///
/// All operations are synchronous and blocking. A nonzero remote exit status
/// surfaces as [`TransportError::CommandFailed`].
pub trait Transport {
    /// Run a command and collect its output.
    fn run(&mut self, cmd: &[&str]) -> Result<CommandOutput, TransportError>;

    /// Run a command and stream all bytes of `input` into its stdin.
    fn pipe(&mut self, cmd: &[&str], input: &mut dyn Read) -> Result<(), TransportError>;

    /// Copy a local file to a path on the remote device.
    fn put(&mut self, source: &Path, dest: &str) -> Result<(), TransportError>;
}

/// A recorded operation on a [`SimTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Run(String),
    Pipe { cmd: String, payload: Vec<u8> },
    Put { source: PathBuf, dest: String },
}

#[derive(Debug, Clone)]
enum SimReply {
    Output(CommandOutput),
    Fail(String),
}

/// A simulated in-memory transport, for testing purposes.
///
/// Every operation is recorded in order. Commands without a canned reply
/// succeed with empty output.
#[derive(Debug, Default)]
pub struct SimTransport {
    replies: HashMap<String, SimReply>,
    pub calls: Vec<SimCall>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the canned reply for a command (given as its joined form).
    pub fn reply(&mut self, cmd: &str, stdout: &[&str], stderr: &[&str]) {
        let output = CommandOutput {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
        };
        self.replies.insert(cmd.to_string(), SimReply::Output(output));
    }

    /// Make a command fail with `CommandFailed`.
    pub fn fail(&mut self, cmd: &str, detail: &str) {
        self.replies
            .insert(cmd.to_string(), SimReply::Fail(detail.to_string()));
    }

    /// The joined command lines of all recorded `Pipe` calls, in order.
    pub fn piped_commands(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Pipe { cmd, .. } => Some(cmd.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The joined command lines of all recorded `Run` calls, in order.
    pub fn run_commands(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SimCall::Run(cmd) => Some(cmd.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for SimTransport {
    fn run(&mut self, cmd: &[&str]) -> Result<CommandOutput, TransportError> {
        let cmd = cmd.join(" ");
        self.calls.push(SimCall::Run(cmd.clone()));
        match self.replies.get(&cmd) {
            Some(SimReply::Fail(detail)) => Err(TransportError::CommandFailed {
                cmd,
                detail: detail.clone(),
            }),
            Some(SimReply::Output(output)) => Ok(output.clone()),
            None => Ok(CommandOutput::default()),
        }
    }

    fn pipe(&mut self, cmd: &[&str], input: &mut dyn Read) -> Result<(), TransportError> {
        let cmd = cmd.join(" ");
        let mut payload = Vec::new();
        input.read_to_end(&mut payload)?;
        self.calls.push(SimCall::Pipe {
            cmd: cmd.clone(),
            payload,
        });
        match self.replies.get(&cmd) {
            Some(SimReply::Fail(detail)) => Err(TransportError::CommandFailed {
                cmd,
                detail: detail.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn put(&mut self, source: &Path, dest: &str) -> Result<(), TransportError> {
        self.calls.push(SimCall::Put {
            source: source.to_path_buf(),
            dest: dest.to_string(),
        });
        Ok(())
    }
}

#[test]
fn test_sim_records_in_order() {
    let mut sim = SimTransport::new();
    sim.run(&["cat", "/proc/cmdline"]).unwrap();
    sim.pipe(&["mtd", "write", "-", "boot"], &mut &b"abc"[..])
        .unwrap();
    sim.put(Path::new("local.cfg"), "/tmp/remote.cfg").unwrap();

    assert_eq!(
        sim.calls,
        vec![
            SimCall::Run("cat /proc/cmdline".into()),
            SimCall::Pipe {
                cmd: "mtd write - boot".into(),
                payload: b"abc".to_vec(),
            },
            SimCall::Put {
                source: PathBuf::from("local.cfg"),
                dest: "/tmp/remote.cfg".into(),
            },
        ]
    );
}

#[test]
fn test_sim_replies() {
    let mut sim = SimTransport::new();
    sim.reply("fw_printenv -n firmware", &["2"], &[]);
    sim.fail("mtd erase fpga1", "mtd: not found");

    let output = sim.run(&["fw_printenv", "-n", "firmware"]).unwrap();
    assert_eq!(output.stdout, vec!["2"]);

    assert!(matches!(
        sim.run(&["mtd", "erase", "fpga1"]),
        Err(TransportError::CommandFailed { .. })
    ));

    // Unscripted commands succeed with empty output
    let output = sim.run(&["sync"]).unwrap();
    assert!(output.stdout.is_empty() && output.stderr.is_empty());
}
