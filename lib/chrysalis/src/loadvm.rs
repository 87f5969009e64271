// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound side of the migration engine.
//!
//! [`Incoming`] owns one load session: the per-session map from section id
//! to registry entry, the return path once the source asks for it, and the
//! postcopy session once an ADVISE arrives.  The main loop reads tagged
//! sections until EOF, dispatching device payloads to their entries and
//! commands to the handlers here.
//!
//! PACKAGED commands recurse: the declared number of bytes is buffered,
//! wrapped in a synthetic reader, and fed back through the same main loop.
//! Command handlers communicate upward through [`LoadExit`] bits rather
//! than unwinding.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use slog::{debug, info, warn};

use crate::error::{MigrateError, Result, VersionError};
use crate::postcopy::PostcopyIncoming;
use crate::proto::{
    RpCommand, SectionType, VmCommand, EOF_MARKER, MAGIC, MAX_PACKAGED_SIZE,
    VERSION, VERSION_COMPAT,
};
use crate::ram::RamMap;
use crate::registry::{Registry, StateEntry};
use crate::stream::{StreamReader, StreamWriter};
use crate::vm::VmControl;

bitflags! {
    /// Bits a command handler can raise to steer the main loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoadExit: u32 {
        /// Leave the current loop once this command completes.
        const QUITLOOP = 1;
        /// Leave the loop one nesting level up; consumed (converted to
        /// QUITLOOP) when a synthetic sub-stream finishes, so it never
        /// escapes past the level that delivered the package.
        const QUITPARENT = 2;
        /// Keep the section-id map alive after the load; a continuous
        /// replication session reuses it every round.
        const KEEPHANDLERS = 4;
    }
}

/// One section id seen in this session, bound to its registry entry and the
/// on-wire version the source declared for it.
struct LoadEntry<'a> {
    se: &'a StateEntry,
    version_id: u32,
}

/// One inbound migration session.
pub struct Incoming<'a> {
    reg: &'a Registry,
    vm: &'a dyn VmControl,
    ram: Arc<RamMap>,
    log: slog::Logger,
    entries: HashMap<u32, LoadEntry<'a>>,
    /// Transport for the reverse channel, parked here until OPENRP.
    return_channel: Option<Box<dyn Write + Send>>,
    return_path: Option<Arc<Mutex<StreamWriter>>>,
    postcopy: Option<PostcopyIncoming>,
}

impl<'a> Incoming<'a> {
    pub fn new(
        reg: &'a Registry,
        vm: &'a dyn VmControl,
        ram: Arc<RamMap>,
        log: slog::Logger,
    ) -> Self {
        Self {
            reg,
            vm,
            ram,
            log,
            entries: HashMap::new(),
            return_channel: None,
            return_path: None,
            postcopy: None,
        }
    }

    /// Provide the write half of the transport, to be opened as the return
    /// path if and when the source sends OPENRP.
    pub fn set_return_channel(&mut self, channel: Box<dyn Write + Send>) {
        self.return_channel = Some(channel);
    }

    pub fn return_path(&self) -> Option<Arc<Mutex<StreamWriter>>> {
        self.return_path.clone()
    }

    pub(crate) fn vm(&self) -> &'a dyn VmControl {
        self.vm
    }

    /// Postcopy protocol position, if an ADVISE has arrived.
    pub fn postcopy(&self) -> Option<&PostcopyIncoming> {
        self.postcopy.as_ref()
    }

    /// Consume one complete stream: header, sections until EOF, post-init
    /// CPU synchronization.  The section-id map is torn down afterwards
    /// unless a command asked for it to be kept.
    pub fn load(&mut self, r: &mut StreamReader) -> Result<()> {
        if let Some(offender) = self.reg.blocked() {
            return Err(MigrateError::Blocked(offender.to_string()));
        }
        self.check_header(r)?;
        let exit = self.load_state_main(r)?;

        self.vm.cpu_synchronize_post_init();

        if !exit.contains(LoadExit::KEEPHANDLERS) {
            self.entries.clear();
        }
        match r.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Header plus begin-phase sections, leaving the section-id map armed
    /// for later rounds.  The opening move of a replication secondary.
    pub fn load_begin(&mut self, r: &mut StreamReader) -> Result<()> {
        self.check_header(r)?;
        self.load_state_main(r)?;
        Ok(())
    }

    /// One round of live state (PART/END sections then EOF), applied
    /// against the map built by [`Incoming::load_begin`].
    pub fn load_ram_state(&mut self, r: &mut StreamReader) -> Result<()> {
        self.load_state_main(r)?;
        Ok(())
    }

    /// A device-only stream (header, FULL sections, EOF) as shipped in a
    /// checkpoint buffer.  Keeps the section-id map for the next round.
    pub fn load_device_state(&mut self, r: &mut StreamReader) -> Result<LoadExit> {
        self.check_header(r)?;
        let exit = self.load_state_main(r)?;
        self.vm.cpu_synchronize_post_init();
        Ok(exit | LoadExit::KEEPHANDLERS)
    }

    fn check_header(&self, r: &mut StreamReader) -> Result<()> {
        let magic = r.get_be32()?;
        if magic != MAGIC {
            return Err(MigrateError::Format(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let version = r.get_be32()?;
        if version == VERSION_COMPAT {
            return Err(MigrateError::UnsupportedVersion(
                VersionError::ObsoleteV2,
            ));
        }
        if version != VERSION {
            return Err(MigrateError::UnsupportedVersion(
                VersionError::Unknown(version),
            ));
        }
        Ok(())
    }

    /// The main loop.  Recursed into for PACKAGED sub-streams.
    pub fn load_state_main(&mut self, r: &mut StreamReader) -> Result<LoadExit> {
        let mut exit = LoadExit::empty();
        loop {
            let ty = r.get_u8()?;
            if ty == EOF_MARKER {
                break;
            }
            let ty = SectionType::try_from(ty).map_err(|_| {
                MigrateError::Format(format!("unknown section type {ty:#04x}"))
            })?;

            match ty {
                SectionType::Start | SectionType::Full => {
                    let section_id = r.get_be32()?;
                    let idstr = r.get_counted_string()?;
                    let instance_id = r.get_be32()? as i32;
                    let version_id = r.get_be32()?;
                    debug!(self.log, "section open";
                        "type" => ?ty, "id" => section_id, "idstr" => &idstr);

                    let se = self
                        .reg
                        .find(&idstr, instance_id)
                        .ok_or_else(|| {
                            MigrateError::UnknownSection(format!(
                                "'{idstr}' instance {instance_id}"
                            ))
                        })?;
                    if version_id > se.version_id() {
                        return Err(MigrateError::UnsupportedVersion(
                            VersionError::Section {
                                idstr,
                                wire: version_id,
                                supported: se.version_id(),
                            },
                        ));
                    }
                    self.entries
                        .insert(section_id, LoadEntry { se, version_id });
                    se.load_section(r, version_id)?;
                }
                SectionType::Part | SectionType::End => {
                    let section_id = r.get_be32()?;
                    let le =
                        self.entries.get(&section_id).ok_or_else(|| {
                            MigrateError::UnknownSection(format!(
                                "section id {section_id}"
                            ))
                        })?;
                    le.se.load_section(r, le.version_id)?;
                }
                SectionType::Command => {
                    let flags = self.process_command(r)?;
                    if flags.contains(LoadExit::QUITLOOP) {
                        return Ok(exit | flags);
                    }
                    exit |= flags;
                }
            }
        }

        if exit.contains(LoadExit::QUITPARENT) {
            // Consume the parent-quit request at this level; the caller one
            // level up sees a plain QUITLOOP.
            exit.remove(LoadExit::QUITPARENT);
            exit.insert(LoadExit::QUITLOOP);
        }
        Ok(exit)
    }

    fn expect_len(cmd: VmCommand, got: u16, want: u16) -> Result<()> {
        if got != want {
            return Err(MigrateError::ProtocolViolation(format!(
                "{cmd:?} received with bad length: expected {want}, got {got}"
            )));
        }
        Ok(())
    }

    fn process_command(&mut self, r: &mut StreamReader) -> Result<LoadExit> {
        let raw = r.get_be16()?;
        let len = r.get_be16()?;
        let cmd = VmCommand::try_from(raw).map_err(|_| {
            MigrateError::ProtocolViolation(format!(
                "unknown command {raw:#06x} (len {len:#06x})"
            ))
        })?;
        debug!(self.log, "command"; "cmd" => ?cmd, "len" => len);

        match cmd {
            VmCommand::OpenReturnPath => {
                Self::expect_len(cmd, len, 0)?;
                self.open_return_path()
            }
            VmCommand::ReqAck => {
                Self::expect_len(cmd, len, 4)?;
                let cookie = r.get_be32()?;
                let rp = self.return_path.clone().ok_or_else(|| {
                    MigrateError::ProtocolViolation(format!(
                        "REQACK ({cookie:#x}) received with no open \
                         return path"
                    ))
                })?;
                rp_ack(&mut rp.lock().unwrap(), cookie)?;
                Ok(LoadExit::empty())
            }
            VmCommand::Packaged => {
                Self::expect_len(cmd, len, 4)?;
                let length = r.get_be32()?;
                self.handle_packaged(length, r)
            }
            VmCommand::PostcopyAdvise => {
                Self::expect_len(cmd, len, 0)?;
                self.postcopy_advise()
            }
            VmCommand::PostcopyDiscard => self.postcopy_discard(r, len),
            VmCommand::PostcopyListen => {
                Self::expect_len(cmd, len, 0)?;
                self.postcopy_listen()
            }
            VmCommand::PostcopyRun => {
                Self::expect_len(cmd, len, 0)?;
                self.postcopy_run()
            }
            VmCommand::PostcopyEnd => {
                Self::expect_len(cmd, len, 1)?;
                self.postcopy_end(r)
            }
        }
    }

    fn open_return_path(&mut self) -> Result<LoadExit> {
        if self.return_path.is_some() {
            // Not really a problem, so don't give up.
            warn!(self.log, "OPENRP with return path already open");
            return Ok(LoadExit::empty());
        }
        let channel = self.return_channel.take().ok_or_else(|| {
            MigrateError::ProtocolViolation(
                "OPENRP failed: no return transport available".to_string(),
            )
        })?;
        self.return_path =
            Some(Arc::new(Mutex::new(StreamWriter::new(channel))));
        info!(self.log, "return path open");
        Ok(LoadExit::empty())
    }

    /// Buffer the declared bytes, wrap them in a synthetic read-only
    /// stream, and run the main loop over it.
    fn handle_packaged(
        &mut self,
        length: u32,
        r: &mut StreamReader,
    ) -> Result<LoadExit> {
        if length > MAX_PACKAGED_SIZE {
            return Err(MigrateError::ProtocolViolation(format!(
                "unreasonably large packaged state: {length}"
            )));
        }
        let bytes = r.get_buffer(length as usize)?;
        debug!(self.log, "loading packaged state"; "len" => length);
        let mut sub = StreamReader::from_bytes(bytes);
        self.load_state_main(&mut sub)
    }

    fn postcopy_advise(&mut self) -> Result<LoadExit> {
        if self.postcopy.is_some() {
            return Err(MigrateError::ProtocolViolation(
                "ADVISE in wrong postcopy state".to_string(),
            ));
        }
        let pc = PostcopyIncoming::advise(Arc::clone(&self.ram), &self.log)?;
        self.postcopy = Some(pc);
        Ok(LoadExit::empty())
    }

    fn postcopy_session(&mut self, cmd: &str) -> Result<&mut PostcopyIncoming> {
        self.postcopy.as_mut().ok_or_else(|| {
            MigrateError::ProtocolViolation(format!(
                "{cmd} in wrong postcopy state (no advise)"
            ))
        })
    }

    fn postcopy_discard(
        &mut self,
        r: &mut StreamReader,
        len: u16,
    ) -> Result<LoadExit> {
        self.postcopy_session("DISCARD")?.handle_discard(r, len)?;
        Ok(LoadExit::empty())
    }

    fn postcopy_listen(&mut self) -> Result<LoadExit> {
        let rp = self.return_path.clone().ok_or_else(|| {
            MigrateError::ProtocolViolation(
                "LISTEN with no open return path".to_string(),
            )
        })?;
        self.postcopy_session("LISTEN")?.enable_notify(rp)?;
        Ok(LoadExit::empty())
    }

    fn postcopy_run(&mut self) -> Result<LoadExit> {
        let vm = self.vm;
        self.postcopy_session("RUN")?.handle_run(vm)?;
        // The run command rides at the tail of the packaged device blob;
        // once the package finishes, the loop that delivered it must stop
        // reading -- the page pipeline owns the channel from here.
        Ok(LoadExit::QUITPARENT)
    }

    fn postcopy_end(&mut self, r: &mut StreamReader) -> Result<LoadExit> {
        let status = r.get_u8()?;
        let stream_error = r.error().is_some();
        let rp = self.return_path.clone();
        self.postcopy_session("END")?.handle_end(
            status,
            stream_error,
            rp.as_ref(),
        )?;
        Ok(LoadExit::empty())
    }
}

/// Messages the source reads off the return path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RpMessage {
    /// The destination is done with the return path; `error` reports
    /// whether its stream had latched a failure.
    Shut { error: bool },
    /// Echo of a REQACK cookie.
    Ack { cookie: u32 },
    /// Demand-fetch request.  `name` is `None` when the block repeats the
    /// previous request's.
    ReqPages { name: Option<String>, offset: u64, length: u32 },
}

fn rp_send(
    w: &mut StreamWriter,
    cmd: RpCommand,
    payload: &[u8],
) -> Result<()> {
    w.put_be16(cmd.into());
    w.put_be16(payload.len() as u16);
    w.put_buffer(payload);
    w.flush()
}

pub fn rp_ack(w: &mut StreamWriter, cookie: u32) -> Result<()> {
    rp_send(w, RpCommand::Ack, &cookie.to_be_bytes())
}

pub fn rp_shut(w: &mut StreamWriter, error: bool) -> Result<()> {
    rp_send(w, RpCommand::Shut, &(error as u32).to_be_bytes())
}

pub fn rp_req_pages(
    w: &mut StreamWriter,
    name: Option<&str>,
    offset: u64,
    length: u32,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(13 + name.map_or(0, str::len));
    match name {
        Some(name) => {
            debug_assert!(name.len() < 256);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
        None => buf.put_u8(0),
    }
    buf.put_u64(offset);
    buf.put_u32(length);
    rp_send(w, RpCommand::ReqPages, &buf)
}

/// Read one return-path frame (source side).
pub fn rp_recv(r: &mut StreamReader) -> Result<RpMessage> {
    let raw = r.get_be16()?;
    let len = r.get_be16()?;
    let cmd = RpCommand::try_from(raw).map_err(|_| {
        MigrateError::ProtocolViolation(format!(
            "unknown return-path message {raw:#06x} (len {len:#06x})"
        ))
    })?;
    match cmd {
        RpCommand::Shut => {
            if len != 4 {
                return Err(MigrateError::ProtocolViolation(format!(
                    "SHUT with bad length {len}"
                )));
            }
            Ok(RpMessage::Shut { error: r.get_be32()? != 0 })
        }
        RpCommand::Ack => {
            if len != 4 {
                return Err(MigrateError::ProtocolViolation(format!(
                    "ACK with bad length {len}"
                )));
            }
            Ok(RpMessage::Ack { cookie: r.get_be32()? })
        }
        RpCommand::ReqPages => {
            let name = r.get_counted_string()?;
            let expected = 1 + name.len() + 12;
            if len as usize != expected {
                return Err(MigrateError::ProtocolViolation(format!(
                    "REQ_PAGES with bad length {len}, expected {expected}"
                )));
            }
            let offset = r.get_be64()?;
            let length = r.get_be32()?;
            Ok(RpMessage::ReqPages {
                name: if name.is_empty() { None } else { Some(name) },
                offset,
                length,
            })
        }
    }
}
