// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Postcopy RAM migration: execution flips from the source to the
//! destination before all memory has been copied, and missing pages are
//! demand-fetched.
//!
//! The source half batches page-discard ranges into compact bitmap
//! messages ([`DiscardState`]).  The destination half
//! ([`PostcopyIncoming`]) walks a one-way state machine driven by in-band
//! commands, registers guest RAM with the kernel's user-fault interface,
//! and runs a dedicated thread that turns faults into page requests on the
//! return path.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{MigrateError, Result};
use crate::proto::TARGET_PAGE_SIZE;
use crate::ram::{host_page_size, Mapping, RamBlock, RamMap};
use crate::savevm;
use crate::stream::{StreamReader, StreamWriter};
use crate::vm::{RunState, VmControl};

/// Upper bound on the `(word, mask)` pairs carried by one DISCARD message;
/// bounds the worst-case allocation on both ends.
pub const MAX_DISCARDS_PER_COMMAND: usize = 12;

/// Source-side accumulator for one RAM block's discard ranges.
///
/// Ranges are converted to 64-page `(word index, mask)` pairs relative to
/// the block's position in the migration bitmap, and shipped whenever
/// [`MAX_DISCARDS_PER_COMMAND`] pairs accumulate or at
/// [`DiscardState::finish`].
pub struct DiscardState<'a> {
    name: &'a str,
    first_bit_offset: u8,
    pairs: Vec<(u64, u64)>,
    sent_pairs: usize,
    sent_cmds: usize,
}

impl<'a> DiscardState<'a> {
    /// `bitmap_offset` is the block's first-page index in the global
    /// migration bitmap; its low six bits say which bit of word zero is the
    /// block's page zero.
    pub fn new(name: &'a str, bitmap_offset: u64) -> Self {
        Self {
            name,
            first_bit_offset: (bitmap_offset % 64) as u8,
            pairs: Vec::with_capacity(MAX_DISCARDS_PER_COMMAND),
            sent_pairs: 0,
            sent_cmds: 0,
        }
    }

    /// Queue an inclusive, block-relative page range for discard.  May emit
    /// a DISCARD command if the batch fills.
    pub fn discard_range(
        &mut self,
        w: &mut StreamWriter,
        first_page: u64,
        last_page: u64,
    ) -> Result<()> {
        assert!(first_page <= last_page);
        let f = self.first_bit_offset as u64;
        let lo = first_page + f;
        let hi = last_page + f;
        for word in (lo / 64)..=(hi / 64) {
            let lobit = if word == lo / 64 { lo % 64 } else { 0 };
            let hibit = if word == hi / 64 { hi % 64 } else { 63 };
            let nbits = hibit - lobit + 1;
            let mask = if nbits == 64 {
                !0u64
            } else {
                ((1u64 << nbits) - 1) << lobit
            };
            self.push_pair(w, word, mask)?;
        }
        Ok(())
    }

    fn push_pair(
        &mut self,
        w: &mut StreamWriter,
        word: u64,
        mask: u64,
    ) -> Result<()> {
        if let Some(last) = self.pairs.last_mut() {
            if last.0 == word {
                last.1 |= mask;
                return Ok(());
            }
        }
        self.pairs.push((word, mask));
        if self.pairs.len() == MAX_DISCARDS_PER_COMMAND {
            self.flush(w)?;
        }
        Ok(())
    }

    fn flush(&mut self, w: &mut StreamWriter) -> Result<()> {
        savevm::send_postcopy_discard(
            w,
            self.name,
            self.first_bit_offset,
            &self.pairs,
        )?;
        self.sent_pairs += self.pairs.len();
        self.sent_cmds += 1;
        self.pairs.clear();
        Ok(())
    }

    /// Ship anything still queued.  Called at the end of the block.
    pub fn finish(mut self, w: &mut StreamWriter) -> Result<()> {
        if !self.pairs.is_empty() {
            self.flush(w)?;
        }
        Ok(())
    }

    /// (pairs, commands) shipped so far.
    pub fn sent(&self) -> (usize, usize) {
        (self.sent_pairs, self.sent_cmds)
    }
}

/// Destination-side protocol position.  Transitions are one-way; `End` is
/// terminal.  "Not yet advised" is the absence of a [`PostcopyIncoming`]
/// altogether.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PostcopyState {
    Advise,
    Listening,
    Running,
    End,
}

/// Payload for an atomic page placement.
pub enum PageSource<'a> {
    /// One host page of data.
    Bytes(&'a [u8]),
    /// The page is zero throughout; the kernel installs it without a copy.
    Zero,
}

/// Destination-side postcopy session, created when ADVISE arrives.
pub struct PostcopyIncoming {
    log: slog::Logger,
    ram: Arc<RamMap>,
    state: PostcopyState,
    mlock_on_exit: bool,
    uffd: Option<kernel::Uffd>,
    quit: Option<kernel::QuitEvent>,
    fault_thread: Option<thread::JoinHandle<()>>,
    tmp_page: Option<Mapping>,
}

impl PostcopyIncoming {
    /// Handle ADVISE: verify the host can do postcopy at all, then ready
    /// every RAM block (contents dropped, standard-sized pages forced).
    pub fn advise(ram: Arc<RamMap>, log: &slog::Logger) -> Result<Self> {
        host_supported()?;
        ram.prepare_for_postcopy()?;
        Ok(Self {
            log: log.new(slog::o!("component" => "postcopy")),
            ram,
            state: PostcopyState::Advise,
            mlock_on_exit: false,
            uffd: None,
            quit: None,
            fault_thread: None,
            tmp_page: None,
        })
    }

    pub fn state(&self) -> PostcopyState {
        self.state
    }

    /// Re-lock guest memory during teardown; the capability probe had to
    /// unlock it (user-fault registration and mlock don't mix).
    pub fn set_mlock_on_exit(&mut self, on: bool) {
        self.mlock_on_exit = on;
    }

    fn wrong_state(&self, cmd: &str) -> MigrateError {
        MigrateError::ProtocolViolation(format!(
            "{cmd} in wrong postcopy state ({:?})",
            self.state
        ))
    }

    /// Handle a DISCARD payload: drop every page the message names.  There
    /// can be many of these, each encoding multiple ranges; all must arrive
    /// before LISTEN.
    pub fn handle_discard(
        &mut self,
        r: &mut StreamReader,
        len: u16,
    ) -> Result<()> {
        if self.state != PostcopyState::Advise {
            return Err(self.wrong_state("DISCARD"));
        }
        // 2-byte header, counted name, at least one 16-byte pair.
        if len < 19 {
            return Err(MigrateError::ProtocolViolation(format!(
                "DISCARD invalid length ({len})"
            )));
        }
        let version = r.get_u8()?;
        if version != 0 {
            return Err(MigrateError::ProtocolViolation(format!(
                "DISCARD invalid version ({version})"
            )));
        }
        let first_bit_offset = r.get_u8()? as u64;
        let name = r.get_counted_string()?;

        let header = 3 + name.len();
        if (len as usize) < header + 16 {
            return Err(MigrateError::ProtocolViolation(format!(
                "DISCARD invalid length ({len})"
            )));
        }
        let remaining = len as usize - header;
        if remaining % 16 != 0 {
            return Err(MigrateError::ProtocolViolation(format!(
                "DISCARD invalid length ({len})"
            )));
        }

        for _ in 0..remaining / 16 {
            let word = r.get_be64()?;
            let mut mask = r.get_be64()?;

            // Walk runs of set bits.  Bit b of word w is block page
            // w * 64 + b - first_bit_offset; the source guarantees no bit
            // below first_bit_offset in word zero.
            while mask != 0 {
                let firstset = mask.trailing_zeros() as u64;
                let filled = mask | ((1u64 << firstset) - 1);
                let firstzero = (!filled).trailing_zeros() as u64;

                if word == 0 && firstset < first_bit_offset {
                    return Err(MigrateError::ProtocolViolation(format!(
                        "DISCARD bit set prior to block '{name}' \
                         (offset {first_bit_offset}, bit {firstset})"
                    )));
                }

                let first_page = word * 64 + firstset - first_bit_offset;
                let last_page = word * 64 + (firstzero - 1) - first_bit_offset;
                self.ram.discard_page_range(&name, first_page, last_page)?;

                mask = if firstzero == 64 {
                    0
                } else {
                    mask & (!0u64 << firstzero)
                };
            }
        }
        Ok(())
    }

    /// Handle LISTEN: open the user-fault channel, start the fault thread,
    /// and register every RAM block for missing-page notifications.  From
    /// here on a guest access to an unfilled page blocks in the kernel
    /// until the page is placed.
    pub fn enable_notify(
        &mut self,
        return_path: Arc<Mutex<StreamWriter>>,
    ) -> Result<()> {
        if self.state != PostcopyState::Advise {
            return Err(self.wrong_state("LISTEN"));
        }

        let uffd = kernel::Uffd::open(true)?;
        // The probe checked the API already; repeat it as an ABI handshake
        // on this fd, which the kernel requires before any register.
        uffd.api_handshake()?;
        let quit = kernel::QuitEvent::new()?;

        let thread = kernel::spawn_fault_thread(
            uffd.as_raw(),
            quit.as_raw(),
            Arc::clone(&self.ram),
            return_path,
            self.log.clone(),
        )?;

        for block in self.ram.blocks() {
            uffd.register(block.host_base() as u64, block.len() as u64)?;
        }

        slog::info!(self.log, "user-fault notification armed";
            "blocks" => self.ram.blocks().count());

        self.uffd = Some(uffd);
        self.quit = Some(quit);
        self.fault_thread = Some(thread);
        self.state = PostcopyState::Listening;
        Ok(())
    }

    /// Handle RUN: the guest may now execute here.
    pub fn handle_run(&mut self, vm: &dyn VmControl) -> Result<()> {
        if self.state != PostcopyState::Listening {
            return Err(self.wrong_state("RUN"));
        }
        if vm.autostart() {
            vm.vm_start();
        } else {
            // Leave it paused; management decides when to start.
            vm.vm_stop(RunState::Paused);
        }
        self.state = PostcopyState::Running;
        Ok(())
    }

    /// Handle END: tear the session down.  A non-zero status byte is the
    /// source's failure reason and fails the load.
    pub fn handle_end(
        &mut self,
        status: u8,
        stream_error: bool,
        return_path: Option<&Arc<Mutex<StreamWriter>>>,
    ) -> Result<()> {
        if self.state == PostcopyState::End {
            return Err(self.wrong_state("END"));
        }
        self.teardown(stream_error, return_path);
        self.state = PostcopyState::End;
        if status != 0 {
            slog::error!(self.log, "postcopy ended in failure";
                "status" => status);
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    /// Place one host page into guest memory.  The kernel installs it
    /// atomically and wakes any thread stalled on the fault.
    pub fn place_page(
        &mut self,
        block: &Arc<RamBlock>,
        offset: u64,
        src: PageSource<'_>,
    ) -> Result<()> {
        if !matches!(
            self.state,
            PostcopyState::Listening | PostcopyState::Running
        ) {
            return Err(self.wrong_state("page placement"));
        }
        let host_page = host_page_size() as u64;
        assert_eq!(offset % host_page, 0);
        assert!(offset + host_page <= block.len() as u64);
        let dst = block.host_base() as u64 + offset;

        match src {
            PageSource::Zero => {
                let uffd = self
                    .uffd
                    .as_ref()
                    .ok_or_else(|| self.wrong_state("page placement"))?;
                uffd.zeropage(dst, host_page)?;
            }
            PageSource::Bytes(bytes) => {
                assert_eq!(bytes.len() as u64, host_page);
                let tmp = self.tmp_page()?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        tmp,
                        bytes.len(),
                    );
                }
                let uffd = self
                    .uffd
                    .as_ref()
                    .ok_or_else(|| self.wrong_state("page placement"))?;
                uffd.copy(dst, tmp as u64, host_page)?;
            }
        }

        let first = offset / TARGET_PAGE_SIZE as u64;
        for page in first..first + host_page / TARGET_PAGE_SIZE as u64 {
            block.mark_received(page);
        }
        Ok(())
    }

    /// The staging page for [`PostcopyIncoming::place_page`]; the same page
    /// is reused, the kernel takes the backing away on each copy.
    fn tmp_page(&mut self) -> Result<*mut u8> {
        if self.tmp_page.is_none() {
            let map = Mapping::new_anon(host_page_size()).map_err(|e| {
                MigrateError::Memory(format!("placement staging page: {e}"))
            })?;
            kernel::dontfork(map.ptr(), map.len())?;
            self.tmp_page = Some(map);
        }
        Ok(self.tmp_page.as_ref().unwrap().ptr())
    }

    fn teardown(
        &mut self,
        stream_error: bool,
        return_path: Option<&Arc<Mutex<StreamWriter>>>,
    ) {
        if let Some(thread) = self.fault_thread.take() {
            if let Some(uffd) = &self.uffd {
                for block in self.ram.blocks() {
                    // Keep going on failure; the fds are closed below
                    // regardless.
                    if let Err(err) = uffd
                        .unregister(block.host_base() as u64, block.len() as u64)
                    {
                        slog::warn!(self.log, "userfault unregister failed";
                            "block" => block.name(), "error" => %err);
                    }
                }
            }
            if let Err(err) = self.ram.restore_huge_pages() {
                slog::warn!(self.log, "restoring huge page preference failed";
                    "error" => %err);
            }

            // Quit ordering: signal the eventfd, join, and only then let
            // the fds close.  The fault thread may still be mid-poll on
            // them until the join completes.
            if let Some(quit) = self.quit.take() {
                match quit.signal() {
                    Ok(()) => {
                        let _ = thread.join();
                    }
                    Err(err) => {
                        slog::error!(self.log,
                            "signalling fault thread failed";
                            "error" => %err);
                    }
                }
            }
            self.uffd = None;
        }

        if self.mlock_on_exit {
            if let Err(err) = kernel::lock_all_memory() {
                // A valid VM state exists; losing mlock isn't fatal.
                slog::warn!(self.log, "re-locking memory failed";
                    "error" => %err);
            }
        }

        if let Some(rp) = return_path {
            let mut w = rp.lock().unwrap();
            if let Err(err) = crate::loadvm::rp_shut(&mut w, stream_error) {
                slog::warn!(self.log, "return-path shut failed";
                    "error" => %err);
            }
        }

        self.tmp_page = None;
    }

    #[cfg(test)]
    pub(crate) fn test_with_state(
        ram: Arc<RamMap>,
        state: PostcopyState,
    ) -> Self {
        Self {
            log: slog::Logger::root(slog::Discard, slog::o!()),
            ram,
            state,
            mlock_on_exit: false,
            uffd: None,
            quit: None,
            fault_thread: None,
            tmp_page: None,
        }
    }
}

/// Whether this host can run a postcopy destination: the target page must
/// fit in a host page, and the kernel must offer a user-fault interface
/// with registration plus atomic wake/copy/zero-page installation.
pub fn host_supported() -> Result<()> {
    if TARGET_PAGE_SIZE > host_page_size() {
        return Err(MigrateError::HostUnsupported(
            "target page size bigger than host page size".to_string(),
        ));
    }
    kernel::probe()
}

#[cfg(target_os = "linux")]
mod kernel {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::error::{MigrateError, Result};
    use crate::loadvm::rp_req_pages;
    use crate::ram::{host_page_size, Mapping, RamMap};
    use crate::stream::StreamWriter;

    fn os_err() -> std::io::Error {
        std::io::Error::last_os_error()
    }

    pub(super) struct Uffd {
        fd: OwnedFd,
    }

    impl Uffd {
        pub(super) fn open(nonblock: bool) -> Result<Self> {
            let mut flags = uffd_api::UFFD_FLAGS_CLOEXEC;
            if nonblock {
                flags |= uffd_api::UFFD_FLAGS_NONBLOCK;
            }
            let fd = unsafe { uffd_api::userfaultfd(flags) };
            if fd < 0 {
                return Err(MigrateError::HostUnsupported(format!(
                    "userfaultfd not available: {}",
                    os_err()
                )));
            }
            Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
        }

        pub(super) fn as_raw(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        /// UFFDIO_API version-and-features handshake; also verifies the fd
        /// supports register/unregister at all.
        pub(super) fn api_handshake(&self) -> Result<()> {
            let mut api = uffd_api::uffdio_api {
                api: uffd_api::UFFD_API,
                ..Default::default()
            };
            let rv = unsafe {
                libc::ioctl(self.as_raw(), uffd_api::UFFDIO_API, &mut api)
            };
            if rv != 0 {
                return Err(MigrateError::HostUnsupported(format!(
                    "UFFDIO_API failed: {}",
                    os_err()
                )));
            }
            let need = (1u64 << uffd_api::_UFFDIO_REGISTER)
                | (1u64 << uffd_api::_UFFDIO_UNREGISTER);
            if api.ioctls & need != need {
                return Err(MigrateError::HostUnsupported(format!(
                    "missing userfault features: {:#x}",
                    !api.ioctls & need
                )));
            }
            Ok(())
        }

        /// Register a range for missing-page notification; returns the
        /// operations the kernel supports on it.
        pub(super) fn register(&self, start: u64, len: u64) -> Result<u64> {
            let mut reg = uffd_api::uffdio_register {
                range: uffd_api::uffdio_range { start, len },
                mode: uffd_api::UFFDIO_REGISTER_MODE_MISSING,
                ioctls: 0,
            };
            let rv = unsafe {
                libc::ioctl(self.as_raw(), uffd_api::UFFDIO_REGISTER, &mut reg)
            };
            if rv != 0 {
                return Err(MigrateError::Io(format!(
                    "userfault register: {}",
                    os_err()
                )));
            }
            Ok(reg.ioctls)
        }

        pub(super) fn unregister(&self, start: u64, len: u64) -> Result<()> {
            let range = uffd_api::uffdio_range { start, len };
            let rv = unsafe {
                libc::ioctl(
                    self.as_raw(),
                    uffd_api::UFFDIO_UNREGISTER,
                    &range,
                )
            };
            if rv != 0 {
                return Err(MigrateError::Io(format!(
                    "userfault unregister: {}",
                    os_err()
                )));
            }
            Ok(())
        }

        pub(super) fn copy(&self, dst: u64, src: u64, len: u64) -> Result<()> {
            let mut copy = uffd_api::uffdio_copy {
                dst,
                src,
                len,
                mode: 0,
                copy: 0,
            };
            let rv = unsafe {
                libc::ioctl(self.as_raw(), uffd_api::UFFDIO_COPY, &mut copy)
            };
            if rv != 0 {
                return Err(MigrateError::Io(format!(
                    "UFFDIO_COPY to {dst:#x}: {}",
                    os_err()
                )));
            }
            Ok(())
        }

        pub(super) fn zeropage(&self, start: u64, len: u64) -> Result<()> {
            let mut zero = uffd_api::uffdio_zeropage {
                range: uffd_api::uffdio_range { start, len },
                mode: 0,
                zeropage: 0,
            };
            let rv = unsafe {
                libc::ioctl(
                    self.as_raw(),
                    uffd_api::UFFDIO_ZEROPAGE,
                    &mut zero,
                )
            };
            if rv != 0 {
                return Err(MigrateError::Io(format!(
                    "UFFDIO_ZEROPAGE at {start:#x}: {}",
                    os_err()
                )));
            }
            Ok(())
        }
    }

    pub(super) struct QuitEvent {
        fd: OwnedFd,
    }

    impl QuitEvent {
        pub(super) fn new() -> Result<Self> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(MigrateError::Io(format!(
                    "opening quit eventfd: {}",
                    os_err()
                )));
            }
            Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
        }

        pub(super) fn as_raw(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        pub(super) fn signal(&self) -> Result<()> {
            let one: u64 = 1;
            let rv = unsafe {
                libc::write(
                    self.as_raw(),
                    &one as *const u64 as *const libc::c_void,
                    8,
                )
            };
            if rv != 8 {
                return Err(MigrateError::Io(format!(
                    "signalling quit eventfd: {}",
                    os_err()
                )));
            }
            Ok(())
        }
    }

    /// Full host capability probe: open a scratch fd, handshake, and
    /// register a test page to learn which placement operations anonymous
    /// memory supports.  Unlocks all memory as a side effect (user-fault
    /// registration and mlock don't mix); teardown re-locks on request.
    pub(super) fn probe() -> Result<()> {
        let uffd = Uffd::open(false)?;
        uffd.api_handshake()?;

        if unsafe { libc::munlockall() } != 0 {
            return Err(MigrateError::HostUnsupported(format!(
                "munlockall: {}",
                os_err()
            )));
        }

        let page = host_page_size();
        let testarea = Mapping::new_anon(page).map_err(|e| {
            MigrateError::HostUnsupported(format!(
                "mapping userfault test area: {e}"
            ))
        })?;

        let supported = uffd.register(testarea.ptr() as u64, page as u64)?;
        uffd.unregister(testarea.ptr() as u64, page as u64)?;

        let need = (1u64 << uffd_api::_UFFDIO_WAKE)
            | (1u64 << uffd_api::_UFFDIO_COPY)
            | (1u64 << uffd_api::_UFFDIO_ZEROPAGE);
        if supported & need != need {
            return Err(MigrateError::HostUnsupported(format!(
                "missing userfault map features: {:#x}",
                !supported & need
            )));
        }
        Ok(())
    }

    pub(super) fn dontfork(ptr: *mut u8, len: usize) -> Result<()> {
        let rv = unsafe {
            libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTFORK)
        };
        if rv != 0 {
            return Err(MigrateError::Io(format!(
                "MADV_DONTFORK on staging page: {}",
                os_err()
            )));
        }
        Ok(())
    }

    pub(super) fn lock_all_memory() -> Result<()> {
        let rv =
            unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rv != 0 {
            return Err(MigrateError::Io(format!("mlockall: {}", os_err())));
        }
        Ok(())
    }

    /// Start the fault thread and wait until it is live; once this returns,
    /// a fault on registered memory will be seen.
    pub(super) fn spawn_fault_thread(
        uffd: RawFd,
        quit: RawFd,
        ram: Arc<RamMap>,
        return_path: Arc<Mutex<StreamWriter>>,
        log: slog::Logger,
    ) -> Result<thread::JoinHandle<()>> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("postcopy/fault".to_string())
            .spawn(move || {
                fault_thread(uffd, quit, ram, return_path, log, ready_tx)
            })
            .map_err(|e| {
                MigrateError::Io(format!("spawning fault thread: {e}"))
            })?;
        ready_rx.recv().map_err(|_| {
            MigrateError::Io("fault thread died during startup".to_string())
        })?;
        Ok(handle)
    }

    /// Turn kernel fault notifications into request-pages messages until
    /// the quit eventfd fires.  Never holds the embedder's global lock.
    fn fault_thread(
        uffd: RawFd,
        quit: RawFd,
        ram: Arc<RamMap>,
        return_path: Arc<Mutex<StreamWriter>>,
        log: slog::Logger,
        ready_tx: mpsc::Sender<()>,
    ) {
        let _ = ready_tx.send(());
        let host_page = host_page_size() as u64;
        let mut last_block: Option<String> = None;

        slog::info!(log, "fault thread running");
        loop {
            let mut pfd = [
                libc::pollfd { fd: uffd, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: quit, events: libc::POLLIN, revents: 0 },
            ];
            let rv = unsafe { libc::poll(pfd.as_mut_ptr(), 2, -1) };
            if rv == -1 {
                if std::io::Error::last_os_error().kind()
                    == std::io::ErrorKind::Interrupted
                {
                    continue;
                }
                slog::error!(log, "userfault poll failed";
                    "error" => %std::io::Error::last_os_error());
                break;
            }
            if pfd[1].revents != 0 {
                slog::info!(log, "fault thread told to quit");
                break;
            }
            if pfd[0].revents == 0 {
                continue;
            }

            // The kernel hands us the faulting host virtual address as a
            // bare 64-bit value.
            let mut addr: u64 = 0;
            let rv = unsafe {
                libc::read(uffd, &mut addr as *mut u64 as *mut libc::c_void, 8)
            };
            if rv != 8 {
                let err = std::io::Error::last_os_error();
                if rv < 0 && err.kind() == std::io::ErrorKind::WouldBlock {
                    // A wake on another thread can race the poll; nothing
                    // to read.
                    continue;
                }
                slog::error!(log, "short read from userfault fd";
                    "got" => rv, "error" => %err);
                break;
            }

            let Some((block, offset)) = ram.block_from_host(addr) else {
                slog::error!(log, "fault outside guest memory";
                    "addr" => format!("{addr:#x}"));
                break;
            };
            // Request whole host pages; the source rounds likewise.
            let offset = offset & !(host_page - 1);
            let name = block.name().to_string();
            let elide = last_block.as_deref() == Some(name.as_str());

            let sent = {
                let mut w = return_path.lock().unwrap();
                rp_req_pages(
                    &mut w,
                    if elide { None } else { Some(&name) },
                    offset,
                    host_page as u32,
                )
            };
            if let Err(err) = sent {
                slog::error!(log, "request-pages send failed";
                    "error" => %err);
                break;
            }
            last_block = Some(name);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod kernel {
    //! This platform has no user-fault kernel interface; the capability
    //! probe refuses and nothing below it can be reached.

    use std::os::fd::RawFd;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::error::{MigrateError, Result};
    use crate::ram::RamMap;
    use crate::stream::StreamWriter;

    fn unsupported() -> MigrateError {
        MigrateError::HostUnsupported(
            "no user-fault kernel interface on this platform".to_string(),
        )
    }

    pub(super) struct Uffd;

    impl Uffd {
        pub(super) fn open(_nonblock: bool) -> Result<Self> {
            Err(unsupported())
        }
        pub(super) fn as_raw(&self) -> RawFd {
            unreachable!()
        }
        pub(super) fn api_handshake(&self) -> Result<()> {
            Err(unsupported())
        }
        pub(super) fn register(&self, _start: u64, _len: u64) -> Result<u64> {
            Err(unsupported())
        }
        pub(super) fn unregister(&self, _start: u64, _len: u64) -> Result<()> {
            Err(unsupported())
        }
        pub(super) fn copy(&self, _d: u64, _s: u64, _l: u64) -> Result<()> {
            Err(unsupported())
        }
        pub(super) fn zeropage(&self, _s: u64, _l: u64) -> Result<()> {
            Err(unsupported())
        }
    }

    pub(super) struct QuitEvent;

    impl QuitEvent {
        pub(super) fn new() -> Result<Self> {
            Err(unsupported())
        }
        pub(super) fn as_raw(&self) -> RawFd {
            unreachable!()
        }
        pub(super) fn signal(&self) -> Result<()> {
            Err(unsupported())
        }
    }

    pub(super) fn probe() -> Result<()> {
        Err(unsupported())
    }

    pub(super) fn dontfork(_ptr: *mut u8, _len: usize) -> Result<()> {
        Ok(())
    }

    pub(super) fn lock_all_memory() -> Result<()> {
        Err(unsupported())
    }

    pub(super) fn spawn_fault_thread(
        _uffd: RawFd,
        _quit: RawFd,
        _ram: Arc<RamMap>,
        _return_path: Arc<Mutex<StreamWriter>>,
        _log: slog::Logger,
    ) -> Result<thread::JoinHandle<()>> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{SectionType, VmCommand};
    use crate::stream::MemBuffer;

    /// Parse the COMMAND sections in `buf`, returning each DISCARD payload.
    fn parse_discards(buf: &MemBuffer) -> Vec<Vec<u8>> {
        let mut r = buf.reader();
        let mut payloads = Vec::new();
        while let Ok(ty) = r.get_u8() {
            assert_eq!(ty, u8::from(SectionType::Command));
            let cmd = r.get_be16().unwrap();
            assert_eq!(cmd, u16::from(VmCommand::PostcopyDiscard));
            let len = r.get_be16().unwrap() as usize;
            payloads.push(r.get_buffer(len).unwrap());
        }
        payloads
    }

    #[test]
    fn batch_fills_at_twelve_and_restarts() {
        let buf = MemBuffer::new();
        let mut w = buf.writer();
        let mut pds = DiscardState::new("pc.ram", 0);

        // Twelve single-word ranges fill one batch exactly.
        for i in 0..12u64 {
            pds.discard_range(&mut w, i * 64, i * 64).unwrap();
        }
        assert_eq!(pds.sent(), (12, 1));

        // A thirteenth starts a new batch, shipped by finish().
        pds.discard_range(&mut w, 12 * 64, 12 * 64).unwrap();
        assert_eq!(pds.sent(), (12, 1));
        pds.finish(&mut w).unwrap();

        assert_eq!(parse_discards(&buf).len(), 2);
    }

    #[test]
    fn adjacent_ranges_merge_into_one_word() {
        let buf = MemBuffer::new();
        let mut w = buf.writer();
        let mut pds = DiscardState::new("pc.ram", 0);

        pds.discard_range(&mut w, 0, 3).unwrap();
        pds.discard_range(&mut w, 8, 8).unwrap();
        pds.finish(&mut w).unwrap();

        let payloads = parse_discards(&buf);
        assert_eq!(payloads.len(), 1);
        let p = &payloads[0];
        // version 0, offset 0, name "pc.ram", one pair.
        assert_eq!(p[0], 0);
        assert_eq!(p[1], 0);
        assert_eq!(p[2], 6);
        assert_eq!(&p[3..9], b"pc.ram");
        assert_eq!(p.len(), 9 + 16);
        let word = u64::from_be_bytes(p[9..17].try_into().unwrap());
        let mask = u64::from_be_bytes(p[17..25].try_into().unwrap());
        assert_eq!(word, 0);
        assert_eq!(mask, 0b1_0000_1111);
    }

    #[test]
    fn first_bit_offset_shifts_the_mask() {
        let buf = MemBuffer::new();
        let mut w = buf.writer();
        // Block starts 12 bits into its first bitmap word.
        let mut pds = DiscardState::new("pc.ram", 64 + 12);
        pds.discard_range(&mut w, 52, 59).unwrap();
        pds.finish(&mut w).unwrap();

        let payloads = parse_discards(&buf);
        let p = &payloads[0];
        assert_eq!(p[1], 12);
        let word = u64::from_be_bytes(p[9..17].try_into().unwrap());
        let mask = u64::from_be_bytes(p[17..25].try_into().unwrap());
        // Pages 52..=59 plus offset 12 land on bits 0..=7 of word 1.
        assert_eq!(word, 1);
        assert_eq!(mask, 0xFF);
    }

    fn advise_session(pages: usize) -> (Arc<RamMap>, PostcopyIncoming) {
        let mut ram = RamMap::new();
        ram.add_block("pc.ram", pages * TARGET_PAGE_SIZE).unwrap();
        let ram = Arc::new(ram);
        let pc = PostcopyIncoming::test_with_state(
            Arc::clone(&ram),
            PostcopyState::Advise,
        );
        (ram, pc)
    }

    fn discard_payload(
        first_bit_offset: u8,
        name: &str,
        pairs: &[(u64, u64)],
    ) -> (Vec<u8>, u16) {
        let mut p = vec![0u8, first_bit_offset, name.len() as u8];
        p.extend_from_slice(name.as_bytes());
        for (word, mask) in pairs {
            p.extend_from_slice(&word.to_be_bytes());
            p.extend_from_slice(&mask.to_be_bytes());
        }
        let len = p.len() as u16;
        (p, len)
    }

    #[test]
    fn discard_decode_drops_the_named_pages() {
        let (ram, mut pc) = advise_session(64);
        let block = ram.block("pc.ram").unwrap();
        for page in 0..64usize {
            block.write_at(page * TARGET_PAGE_SIZE, &[0xAB; 8]);
        }

        // first_bit_offset 12, word 1, mask 0xFF: pages 52..=59.
        let (payload, len) =
            discard_payload(12, "pc.ram", &[(1, 0x0000_0000_0000_00FF)]);
        let mut r = StreamReader::from_bytes(payload);
        pc.handle_discard(&mut r, len).unwrap();

        let mut buf = [0u8; 8];
        for page in 0..64usize {
            block.read_at(page * TARGET_PAGE_SIZE, &mut buf);
            if (52..=59).contains(&page) {
                assert_eq!(buf, [0u8; 8], "page {page} should be discarded");
            } else {
                assert_eq!(buf, [0xAB; 8], "page {page} should survive");
            }
        }
    }

    #[test]
    fn discard_rejects_bits_before_the_block() {
        let (_ram, mut pc) = advise_session(64);
        // Bit 3 of word 0 is below first_bit_offset 12.
        let (payload, len) = discard_payload(12, "pc.ram", &[(0, 1 << 3)]);
        let mut r = StreamReader::from_bytes(payload);
        assert!(matches!(
            pc.handle_discard(&mut r, len),
            Err(MigrateError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn discard_rejects_bad_version_and_length() {
        let (_ram, mut pc) = advise_session(4);

        let (mut payload, len) = discard_payload(0, "pc.ram", &[(0, 1)]);
        payload[0] = 1;
        let mut r = StreamReader::from_bytes(payload);
        assert!(pc.handle_discard(&mut r, len).is_err());

        let (payload, _) = discard_payload(0, "pc.ram", &[(0, 1)]);
        let mut r = StreamReader::from_bytes(payload);
        // Truncated: not a multiple of 16 after the name.
        assert!(pc.handle_discard(&mut r, 24).is_err());
    }

    #[test]
    fn state_machine_is_one_way() {
        let (_ram, mut pc) = advise_session(4);
        assert_eq!(pc.state(), PostcopyState::Advise);

        // RUN before LISTEN is refused.
        struct NullVm;
        impl VmControl for NullVm {
            fn vm_stop(&self, _s: RunState) {}
            fn vm_start(&self) {}
            fn cpu_synchronize_states(&self) {}
            fn cpu_synchronize_post_init(&self) {}
            fn system_reset(&self) {}
        }
        assert!(matches!(
            pc.handle_run(&NullVm),
            Err(MigrateError::ProtocolViolation(_))
        ));

        // DISCARD is refused once past Advise.
        let mut pc = PostcopyIncoming::test_with_state(
            Arc::new(RamMap::new()),
            PostcopyState::Running,
        );
        let (payload, len) = discard_payload(0, "pc.ram", &[(0, 1)]);
        let mut r = StreamReader::from_bytes(payload);
        assert!(matches!(
            pc.handle_discard(&mut r, len),
            Err(MigrateError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn end_is_terminal() {
        let (_ram, mut pc) = advise_session(4);
        // Status zero tears down and succeeds even straight from Advise.
        pc.handle_end(0, false, None).unwrap();
        assert_eq!(pc.state(), PostcopyState::End);
        assert!(pc.handle_end(0, false, None).is_err());
    }

    #[test]
    fn nonzero_end_status_fails_the_session() {
        let (_ram, mut pc) = advise_session(4);
        assert_eq!(
            pc.handle_end(3, false, None),
            Err(MigrateError::Cancelled)
        );
        assert_eq!(pc.state(), PostcopyState::End);
    }
}
