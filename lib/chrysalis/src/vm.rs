// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the migration engine and the machine that owns the
//! guest.  Implementations perform these operations under the embedder's
//! global lock; the engine never takes that lock itself.

/// Run states the engine can ask the machine to enter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    Running,
    Paused,
    /// Stopped to serialize a consistent snapshot.
    SaveVm,
    /// Stopped at a checkpoint boundary of a replication session.
    Checkpoint,
}

pub trait VmControl: Send + Sync {
    /// Stop guest vCPUs, entering `state`.
    fn vm_stop(&self, state: RunState);

    fn vm_start(&self);

    /// Flush cached vCPU state into the device model so entries serialize a
    /// consistent view.
    fn cpu_synchronize_states(&self);

    /// Push loaded state back into the vCPUs after a successful load.
    fn cpu_synchronize_post_init(&self);

    /// Full machine reset, performed before applying a checkpoint.
    fn system_reset(&self);

    /// Whether the guest should begin running as soon as a postcopy RUN
    /// command arrives, or stay paused for the management layer.
    fn autostart(&self) -> bool {
        true
    }
}
