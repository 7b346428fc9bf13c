//! Process-boundary error types.
//!
//! Logical aborts and transport failures are distinguished all the way up to
//! the exit code: scripts wrapping this tool rely on the difference between
//! "the bundle/device combination was rejected" and "the network/session
//! fell over".

use std::io;

use thiserror::Error;

use crate::transport::TransportError;

/// A logical condition that stops the restoration.
///
/// None of these indicate an environment failure; they mean the inputs or the
/// device state rule out proceeding.
#[derive(Error, Debug)]
pub enum RestoreAbort {
    #[error("unsupported firmware bundle: {0}")]
    UnsupportedBundle(String),

    #[error("firmware platform '{bundle}' is incompatible with device platform '{device}'")]
    IncompatiblePlatform { bundle: String, device: String },

    #[error("miner configuration value for '{0}' is empty")]
    EmptyConfig(String),

    #[error("restoration cancelled")]
    Declined,
}

/// Top-level error for a restoration run.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Abort(#[from] RestoreAbort),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RestoreError {
    /// Exit code for the process boundary: logical aborts are 2, everything
    /// else (transport and local environment failures) is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RestoreError::Abort(_) => 2,
            _ => 1,
        }
    }
}

#[test]
fn test_exit_codes() {
    let abort: RestoreError = RestoreAbort::Declined.into();
    assert_eq!(abort.exit_code(), 2);

    let transport: RestoreError = TransportError::Connect {
        host: "miner".into(),
        detail: "unreachable".into(),
    }
    .into();
    assert_eq!(transport.exit_code(), 1);

    let io: RestoreError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
    assert_eq!(io.exit_code(), 1);
}
