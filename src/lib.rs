//! Remote restoration of mining-controller firmware.
//!
//! The restoration drives a remote device back to a known-good firmware
//! state: unpack a firmware bundle, validate it against the connected
//! device's platform, stream its components into the device's flash
//! partitions over an SSH session, and regenerate or preserve the
//! device-native miner configuration.
//!
//! Flash writes are irreversible and order-dependent. There is no rollback:
//! any failure aborts the whole restoration, and a partially restored device
//! is expected to be recovered via the platform's fallback procedure.

pub mod bundle;
pub mod config;
pub mod error;
pub mod fetch;
pub mod flash;
pub mod probe;
pub mod restore;
pub mod transport;
