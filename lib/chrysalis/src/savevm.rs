// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound side of the migration engine.
//!
//! A complete save is three phases over the registry, in insertion order:
//! begin (START sections for live entries), iterate (PART sections until
//! every live entry reports done or the rate budget runs out), and complete
//! (END sections, then one FULL section per whole-state entry, then EOF).
//! In-band commands are multiplexed onto the same stream as COMMAND
//! sections and flushed eagerly, since the peer often blocks on them.

use bytes::{BufMut, BytesMut};

use crate::error::{MigrateError, Result};
use crate::proto::{
    SectionType, VmCommand, EOF_MARKER, MAGIC, MAX_PACKAGED_SIZE, VERSION,
};
use crate::registry::{IterateStatus, Registry, StateEntry};
use crate::stream::StreamWriter;
use crate::vm::VmControl;
use crate::MigrationParams;

fn put_full_header(w: &mut StreamWriter, ty: SectionType, e: &StateEntry) {
    w.put_u8(ty.into());
    w.put_be32(e.section_id());
    w.put_counted_string(e.idstr());
    w.put_be32(e.instance_id() as u32);
    w.put_be32(e.version_id());
}

fn put_part_header(w: &mut StreamWriter, ty: SectionType, e: &StateEntry) {
    w.put_u8(ty.into());
    w.put_be32(e.section_id());
}

/// Begin phase: emit the file header and each live entry's START section.
///
/// Runs without the embedder's global lock; live setup hooks must tolerate a
/// running guest.
pub fn state_begin(
    reg: &Registry,
    w: &mut StreamWriter,
    params: &MigrationParams,
) -> Result<()> {
    for e in reg.entries() {
        if let Some(ops) = e.live_ops() {
            ops.set_params(params);
        }
    }

    w.put_be32(MAGIC);
    w.put_be32(VERSION);

    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() {
            continue;
        }
        put_full_header(w, SectionType::Start, e);
        if let Err(err) = ops.setup(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }
    match w.error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One pass of the iterate phase.
///
/// Returns [`IterateStatus::Done`] only when every active live entry
/// reported done in this pass.  An entry that still has data holds the
/// cursor: later entries are not visited until it finishes, so a
/// fast-changing entry cannot starve the ones behind it.  A spent rate
/// budget yields [`IterateStatus::Again`] without visiting further entries.
pub fn state_iterate(
    reg: &Registry,
    w: &mut StreamWriter,
) -> Result<IterateStatus> {
    let mut status = IterateStatus::Done;
    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() {
            continue;
        }
        if w.rate_limit_exceeded() {
            return Ok(IterateStatus::Again);
        }
        put_part_header(w, SectionType::Part, e);
        match ops.iterate(w) {
            Err(err) => {
                w.set_error(err.clone());
                return Err(err);
            }
            Ok(IterateStatus::Again) => {
                status = IterateStatus::Again;
                break;
            }
            Ok(IterateStatus::Done) => {}
        }
    }
    Ok(status)
}

/// Complete phase: final END sections for live entries, then a FULL section
/// per whole-state entry, then EOF (unless a postcopy phase is still to
/// come).
///
/// Callers hold the embedder's global lock across this; the guest must not
/// mutate state mid-section.
pub fn state_complete(
    reg: &Registry,
    w: &mut StreamWriter,
    vm: &dyn VmControl,
    in_postcopy: bool,
) -> Result<()> {
    vm.cpu_synchronize_states();

    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() {
            continue;
        }
        if in_postcopy && ops.can_postcopy() {
            // Completed after the flip by state_postcopy_complete().
            continue;
        }
        put_part_header(w, SectionType::End, e);
        if let Err(err) = ops.complete(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }

    for e in reg.entries() {
        if !e.has_full_section() {
            continue;
        }
        put_full_header(w, SectionType::Full, e);
        if let Err(err) = e.save_full(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }

    if !in_postcopy {
        w.put_u8(EOF_MARKER);
    }
    w.flush()
}

/// Post-flip completion: END sections for the postcopy-capable entries that
/// [`state_complete`] skipped, a zero-status POSTCOPY_END, and EOF.
pub fn state_postcopy_complete(
    reg: &Registry,
    w: &mut StreamWriter,
) -> Result<()> {
    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() || !ops.can_postcopy() {
            continue;
        }
        put_part_header(w, SectionType::End, e);
        if let Err(err) = ops.complete(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }
    send_postcopy_end(w, 0)?;
    w.put_u8(EOF_MARKER);
    w.flush()
}

/// Estimate of bytes still to transfer, split by whether the owning entries
/// can complete after a postcopy flip.  Drives the flip-point decision.
pub fn state_pending(reg: &Registry, max_size: u64) -> (u64, u64) {
    let mut non_postcopiable = 0;
    let mut postcopiable = 0;
    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() {
            continue;
        }
        let pending = ops.pending(max_size);
        if ops.can_postcopy() {
            postcopiable += pending;
        } else {
            non_postcopiable += pending;
        }
    }
    (non_postcopiable, postcopiable)
}

/// Fan a cancellation out to every live entry.
pub fn state_cancel(reg: &Registry) {
    for e in reg.entries() {
        if let Some(ops) = e.live_ops() {
            ops.cancel();
        }
    }
}

/// Produce a complete precopy stream: begin, iterate to quiescence,
/// complete.  On any failure the per-entry cancel hooks run before the
/// error is returned.
pub fn save(
    reg: &Registry,
    w: &mut StreamWriter,
    vm: &dyn VmControl,
    params: &MigrationParams,
) -> Result<()> {
    if let Some(offender) = reg.blocked() {
        return Err(MigrateError::Blocked(offender.to_string()));
    }

    let res = (|| {
        state_begin(reg, w, params)?;
        loop {
            if let Some(err) = w.error() {
                return Err(err);
            }
            if state_iterate(reg, w)? == IterateStatus::Done {
                break;
            }
        }
        state_complete(reg, w, vm, false)
    })();

    if res.is_err() {
        state_cancel(reg);
    }
    res
}

/// Serialize only whole-state (non-RAM) entries: header, FULL sections,
/// EOF.  This is the device half of a checkpoint round, and is also usable
/// standalone for device-state export.
pub fn save_device_state(
    reg: &Registry,
    w: &mut StreamWriter,
    vm: &dyn VmControl,
) -> Result<()> {
    w.put_be32(MAGIC);
    w.put_be32(VERSION);

    vm.cpu_synchronize_states();

    for e in reg.entries() {
        if e.is_ram() || !e.has_full_section() {
            continue;
        }
        put_full_header(w, SectionType::Full, e);
        if let Err(err) = e.save_full(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }

    w.put_u8(EOF_MARKER);
    w.flush()
}

/// The live half of a checkpoint round: final END sections for live entries
/// followed by EOF, with no file header.  The receiving side feeds this to
/// a load loop whose entry map survives from the session's begin phase.
pub fn save_live_state(reg: &Registry, w: &mut StreamWriter) -> Result<()> {
    for e in reg.entries() {
        let Some(ops) = e.live_ops() else { continue };
        if !ops.is_active() {
            continue;
        }
        put_part_header(w, SectionType::End, e);
        if let Err(err) = ops.complete(w) {
            w.set_error(err.clone());
            return Err(err);
        }
    }
    w.put_u8(EOF_MARKER);
    w.flush()
}

/// Write a COMMAND section and flush it to the peer.
pub fn send_command(
    w: &mut StreamWriter,
    cmd: VmCommand,
    payload: &[u8],
) -> Result<()> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    w.put_u8(SectionType::Command.into());
    w.put_be16(cmd.into());
    w.put_be16(payload.len() as u16);
    w.put_buffer(payload);
    w.flush()
}

/// Ask the destination to open the reverse acknowledgement channel.
pub fn send_openrp(w: &mut StreamWriter) -> Result<()> {
    send_command(w, VmCommand::OpenReturnPath, &[])
}

/// Request an acknowledgement carrying `cookie` on the return path.
pub fn send_reqack(w: &mut StreamWriter, cookie: u32) -> Result<()> {
    send_command(w, VmCommand::ReqAck, &cookie.to_be_bytes())
}

/// Ship a pre-serialized chunk of migration stream.  The command payload is
/// just the length; the raw bytes follow immediately so the receiver can
/// buffer them without interpreting them inline.
pub fn send_packaged(w: &mut StreamWriter, package: &[u8]) -> Result<()> {
    if package.len() > MAX_PACKAGED_SIZE as usize {
        return Err(MigrateError::Memory(format!(
            "packaged state of {} bytes exceeds limit",
            package.len()
        )));
    }
    let len = package.len() as u32;
    send_command(w, VmCommand::Packaged, &len.to_be_bytes())?;
    w.put_buffer(package);
    w.flush()
}

/// Sent once, before any RAM data, if a postcopy flip may happen later.
pub fn send_postcopy_advise(w: &mut StreamWriter) -> Result<()> {
    send_command(w, VmCommand::PostcopyAdvise, &[])
}

/// Get the destination ready to receive demand-fetched page data.
pub fn send_postcopy_listen(w: &mut StreamWriter) -> Result<()> {
    send_command(w, VmCommand::PostcopyListen, &[])
}

/// Kick the destination into running.
pub fn send_postcopy_run(w: &mut StreamWriter) -> Result<()> {
    send_command(w, VmCommand::PostcopyRun, &[])
}

/// End of postcopy; status zero is success, anything else is the failure
/// reason.
pub fn send_postcopy_end(w: &mut StreamWriter, status: u8) -> Result<()> {
    send_command(w, VmCommand::PostcopyEnd, &[status])
}

/// One batch of page-discard ranges for a single RAM block.
///
/// Payload layout (§ wire format): version byte, the bit offset within the
/// first word that corresponds to the block's page zero, counted block
/// name, then `(be64 word index, be64 mask)` pairs.
pub(crate) fn send_postcopy_discard(
    w: &mut StreamWriter,
    name: &str,
    first_bit_offset: u8,
    pairs: &[(u64, u64)],
) -> Result<()> {
    assert!(name.len() < 256);
    let mut buf = BytesMut::with_capacity(3 + name.len() + pairs.len() * 16);
    buf.put_u8(0); // version
    buf.put_u8(first_bit_offset);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    for (word, mask) in pairs {
        buf.put_u64(*word);
        buf.put_u64(*mask);
    }
    send_command(w, VmCommand::PostcopyDiscard, &buf)
}
