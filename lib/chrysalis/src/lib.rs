// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! chrysalis: the core of a VM live-migration subsystem.
//!
//! Devices register serialization descriptors in a [`registry::Registry`];
//! [`savevm`] walks them to produce a tagged, versioned binary stream and
//! [`loadvm`] replays one into a registered set on the destination.  On
//! top of that engine ride two transfer disciplines: [`postcopy`], which
//! flips execution before all RAM has moved and demand-fetches the rest
//! through a kernel user-fault channel, and [`colo`], which repeats full
//! checkpoints from a primary to a secondary for continuous replication.
//!
//! Transports, monitor surfaces, and per-device serialization formats are
//! the embedder's business; this crate exposes only programmatic
//! operations over `Read`/`Write` byte channels.

pub mod colo;
pub mod error;
pub mod loadvm;
pub mod postcopy;
pub mod proto;
pub mod ram;
pub mod registry;
pub mod savevm;
pub mod stream;
pub mod vm;

pub use error::{MigrateError, MigrateStateError, Result, VersionError};
pub use registry::Registry;

/// Per-migration knobs observed by live entries before the begin phase.
#[derive(Copy, Clone, Debug, Default)]
pub struct MigrationParams {
    /// Migrate block-device contents inline with the stream.
    pub blk: bool,
    /// The destination shares storage; block contents stay put.
    pub shared: bool,
}
