// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level constants for the migration stream.
//!
//! A stream is a big-endian file header followed by tagged sections:
//!
//! ```text
//! file    = be32 MAGIC, be32 VERSION, section*, u8 0x00 (EOF)
//! section = u8 type, type-specific header, opaque payload
//! command = u8 0x05, be16 cmd, be16 len, len bytes
//! ```
//!
//! START and FULL sections carry the full entry header (section id, counted
//! identifier string, instance id, version id); PART and END carry only the
//! section id and rely on the receiver's per-session map.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const MAGIC: u32 = 0x4348_5253;
pub const VERSION: u32 = 3;
/// The long-dead v2 format; recognized so it can be refused by name.
pub const VERSION_COMPAT: u32 = 2;

/// Stream terminator, distinct from every `SectionType` value.
pub const EOF_MARKER: u8 = 0x00;

/// Pages on the wire are in fixed 4 KiB target-page units regardless of the
/// host page size on either end.
pub const TARGET_PAGE_BITS: u32 = 12;
pub const TARGET_PAGE_SIZE: usize = 1 << TARGET_PAGE_BITS;

/// Upper bound on an embedded PACKAGED sub-stream.
pub const MAX_PACKAGED_SIZE: u32 = 256 * 1024 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SectionType {
    /// Opens an entry's iterative transfer; carries the full header.
    Start = 0x01,
    /// One round of an iterative transfer; section id only.
    Part = 0x02,
    /// Final round of an iterative transfer; section id only.
    End = 0x03,
    /// A whole entry in one section; carries the full header.
    Full = 0x04,
    /// In-band command, multiplexed on the same stream.
    Command = 0x05,
}

/// In-band commands carried in COMMAND sections.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum VmCommand {
    /// Ask the destination to open the reverse acknowledgement channel.
    OpenReturnPath = 1,
    /// Carries a be32 cookie to be echoed on the return path.
    ReqAck = 2,
    /// A be32 length followed by that many raw bytes of embedded stream.
    Packaged = 3,
    /// A postcopy flip may occur later; sent before any RAM data.
    PostcopyAdvise = 4,
    /// Page ranges the destination must drop before running.
    PostcopyDiscard = 5,
    /// Arm the destination's fault handling.
    PostcopyListen = 6,
    /// Flip execution to the destination.
    PostcopyRun = 7,
    /// One status byte; zero is success.
    PostcopyEnd = 8,
}

/// Checkpoint-protocol commands, written directly to the stream as be32
/// values (with an optional be64 operand) rather than inside COMMAND
/// sections.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ColoCommand {
    CheckpointRequest = 0,
    CheckpointReady = 1,
    VmstateSend = 2,
    VmstateSize = 3,
    VmstateReceived = 4,
    VmstateLoaded = 5,
    GuestShutdown = 6,
}

/// Return-path frames (destination to source): be16 type, be16 len, payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum RpCommand {
    /// Final frame; u32 payload is non-zero when the destination latched an
    /// error.
    Shut = 1,
    /// Echo of a REQACK cookie.
    Ack = 2,
    /// Demand-fetch request: counted block name (zero-length when repeating
    /// the previous block), be64 offset, be32 length.
    ReqPages = 3,
}
