// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Errors which may occur while producing or consuming a migration stream.
///
/// The stream itself is error-sticky: the first failure is latched on the
/// stream and every later primitive reports that same error (see
/// [`crate::stream`]).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MigrateError {
    /// Bad magic, an unrecognized section type, or otherwise malformed
    /// framing.
    #[error("stream format error: {0}")]
    Format(String),

    /// The stream (or a section within it) carried a version we don't
    /// support.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(#[from] VersionError),

    /// A section referenced an identifier or section id with no registered
    /// counterpart.
    #[error("unknown section: {0}")]
    UnknownSection(String),

    /// A command arrived in a state that cannot accept it, or carried a
    /// payload of the wrong shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A registered device refuses migration outright.
    #[error("state blocked by non-migratable device '{0}'")]
    Blocked(String),

    /// Transport error latched on the stream.
    #[error("I/O error: {0}")]
    Io(String),

    /// The host lacks the kernel support this operation requires.
    #[error("host unsupported: {0}")]
    HostUnsupported(String),

    /// An allocation or staging buffer could not be grown.
    #[error("out of memory: {0}")]
    Memory(String),

    /// The user or the peer asked for the migration to stop.
    #[error("migration cancelled")]
    Cancelled,

    /// A device failed to export or import its state.
    #[error("device state error: {0}")]
    DeviceState(#[from] MigrateStateError),
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> MigrateError {
        MigrateError::Io(err.to_string())
    }
}

/// The reasons a stream or section version can be refused.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum VersionError {
    /// The file header named a version this library has never spoken.
    #[error("stream version {0} is unknown")]
    Unknown(u32),

    /// The v2 stream format, recognized only well enough to refuse it.
    #[error("stream version 2 is obsolete and can no longer be loaded")]
    ObsoleteV2,

    /// A section was produced by a newer device than the one registered
    /// here.
    #[error("section '{idstr}' v{wire} exceeds registered v{supported}")]
    Section { idstr: String, wire: u32, supported: u32 },
}

/// Errors encountered while a device exports or imports its own state.
#[derive(
    Clone, Debug, Error, serde::Deserialize, PartialEq, serde::Serialize,
)]
pub enum MigrateStateError {
    /// The device doesn't support live migration.
    #[error("device not migratable")]
    NonMigratable,

    /// Encountered an error trying to deserialize the device state during
    /// import.
    #[error("couldn't deserialize device state: {0}")]
    ImportDeserialization(String),

    /// The device doesn't implement state importation.
    #[error("device state importation unimplemented for `{0}`")]
    ImportUnimplemented(String),

    /// The device failed to apply the deserialized state.
    #[error("failed to apply deserialized device state: {0}")]
    ImportFailed(String),

    /// The device failed to serialize its state.
    #[error("failed to export device state: {0}")]
    ExportFailed(String),
}

impl From<erased_serde::Error> for MigrateStateError {
    fn from(err: erased_serde::Error) -> Self {
        MigrateStateError::ImportDeserialization(err.to_string())
    }
}

impl From<ron::Error> for MigrateStateError {
    fn from(err: ron::Error) -> Self {
        MigrateStateError::ImportDeserialization(err.to_string())
    }
}
