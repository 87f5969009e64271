// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coarse-grain lock-stepping: continuous replication driven by periodic
//! full checkpoints from a primary to a secondary.
//!
//! Both peers ride the ordinary migration stream.  The primary primes the
//! stream with a begin phase, then repeats checkpoint transactions: stop
//! the guest, ship live state inline and device state through a staging
//! buffer, wait for the secondary's acknowledgements on the return path,
//! release buffered guest packets, resume.  The secondary mirrors each
//! step and applies the device buffer under its own lock.  Either peer can
//! be asked to take over (failover) through a side channel at any moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use slog::{error, info};

use crate::error::{MigrateError, Result};
use crate::loadvm::Incoming;
use crate::proto::ColoCommand;
use crate::registry::Registry;
use crate::savevm;
use crate::stream::{MemBuffer, StreamReader, StreamWriter};
use crate::vm::{RunState, VmControl};
use crate::MigrationParams;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ColoMode {
    Primary,
    Secondary,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ColoExitReason {
    Error,
    Request,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplicationMode {
    Primary,
    Secondary,
}

/// Operations the embedding machine supplies to a checkpoint peer.
/// Implementations take the global lock themselves where needed.
pub trait ColoOps: Send + Sync {
    fn start_replication(&self, mode: ReplicationMode) -> Result<()>;

    /// Stop block replication; `failover` says this peer is taking over
    /// rather than shutting down in an orderly fashion.
    fn stop_replication(&self, failover: bool);

    /// Block-driver checkpoint: sync on the primary, discard the staged
    /// writes on the secondary.
    fn do_checkpoint(&self) -> Result<()>;

    /// Toggle buffering of guest-transmitted packets.  Buffered packets
    /// are only released once the peer has acknowledged the checkpoint
    /// that covers them.
    fn set_packet_filters(&self, buffering: bool) -> Result<()>;

    fn release_buffered_packets(&self);

    /// A guest shutdown has been requested and should be folded into the
    /// next checkpoint round.
    fn shutdown_requested(&self) -> bool;

    fn request_system_shutdown(&self);

    /// Structured exit event, emitted once when a peer leaves the
    /// checkpoint loop.
    fn colo_exit(&self, mode: ColoMode, reason: ColoExitReason);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailoverStatus {
    None,
    /// A takeover has been requested and awaits handling.
    Require,
    /// The request arrived mid-load and is parked until the load finishes.
    Relaunch,
    Completed,
}

/// Failover arbitration shared between the checkpoint loop and whatever
/// side channel carries takeover requests.
pub struct FailoverArbiter {
    state: Mutex<FailoverStatus>,
    vmstate_loading: AtomicBool,
}

impl Default for FailoverArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverArbiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FailoverStatus::None),
            vmstate_loading: AtomicBool::new(false),
        }
    }

    /// Ask this peer to take over.  Mid-load requests park in `Relaunch`;
    /// applying a half-loaded checkpoint would wreck the secondary.
    pub fn request(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == FailoverStatus::None {
            *state = if self.vmstate_loading.load(Ordering::Acquire) {
                FailoverStatus::Relaunch
            } else {
                FailoverStatus::Require
            };
        }
    }

    /// A takeover request is pending or parked.
    pub fn active(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            FailoverStatus::Require | FailoverStatus::Relaunch
        )
    }

    pub fn state(&self) -> FailoverStatus {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_loading(&self, on: bool) {
        self.vmstate_loading.store(on, Ordering::Release);
    }

    /// Re-raise a request that was parked during a load.  Returns whether
    /// one was waiting.
    pub(crate) fn take_relaunch(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == FailoverStatus::Relaunch {
            *state = FailoverStatus::Require;
            true
        } else {
            false
        }
    }

    pub(crate) fn complete(&self) {
        *self.state.lock().unwrap() = FailoverStatus::Completed;
    }
}

#[derive(Clone, Debug)]
pub struct ColoConfig {
    /// Minimum time between checkpoint transactions.
    pub checkpoint_delay: Duration,
}

impl Default for ColoConfig {
    fn default() -> Self {
        Self { checkpoint_delay: Duration::from_millis(200) }
    }
}

fn colo_put_cmd(w: &mut StreamWriter, cmd: ColoCommand) -> Result<()> {
    w.put_be32(cmd.into());
    w.flush()
}

fn colo_put_cmd_value(
    w: &mut StreamWriter,
    cmd: ColoCommand,
    value: u64,
) -> Result<()> {
    colo_put_cmd(w, cmd)?;
    w.put_be64(value);
    w.flush()
}

fn colo_get_cmd(r: &mut StreamReader) -> Result<ColoCommand> {
    let raw = r.get_be32()?;
    ColoCommand::try_from(raw).map_err(|_| {
        MigrateError::ProtocolViolation(format!(
            "invalid checkpoint command {raw:#x}"
        ))
    })
}

fn colo_get_check_cmd(
    r: &mut StreamReader,
    expect: ColoCommand,
) -> Result<()> {
    let cmd = colo_get_cmd(r)?;
    if cmd != expect {
        return Err(MigrateError::ProtocolViolation(format!(
            "unexpected checkpoint command {cmd:?}, expected {expect:?}"
        )));
    }
    Ok(())
}

fn colo_get_cmd_value(
    r: &mut StreamReader,
    expect: ColoCommand,
) -> Result<u64> {
    colo_get_check_cmd(r, expect)?;
    r.get_be64()
}

enum Round {
    Continue,
    Shutdown,
}

/// The primary's side of a checkpoint session.
pub struct ColoPrimary<'a> {
    reg: &'a Registry,
    vm: &'a dyn VmControl,
    ops: &'a dyn ColoOps,
    failover: &'a FailoverArbiter,
    cfg: ColoConfig,
    log: slog::Logger,
}

impl<'a> ColoPrimary<'a> {
    pub fn new(
        reg: &'a Registry,
        vm: &'a dyn VmControl,
        ops: &'a dyn ColoOps,
        failover: &'a FailoverArbiter,
        cfg: ColoConfig,
        log: &slog::Logger,
    ) -> Self {
        Self {
            reg,
            vm,
            ops,
            failover,
            cfg,
            log: log.new(slog::o!("colo_mode" => "primary")),
        }
    }

    /// Run the checkpoint loop until failover, error, or a guest shutdown
    /// round.  `to_dst` is the migration stream, `from_dst` the return
    /// path.
    pub fn run(
        &self,
        to_dst: &mut StreamWriter,
        from_dst: &mut StreamReader,
    ) -> Result<()> {
        let res = self.process(to_dst, from_dst);
        if let Err(err) = &res {
            self.exit_on_error(ColoMode::Primary, err);
        }
        res
    }

    fn exit_on_error(&self, mode: ColoMode, err: &MigrateError) {
        let reason = if self.failover.active() {
            ColoExitReason::Request
        } else {
            ColoExitReason::Error
        };
        match reason {
            ColoExitReason::Request => {
                info!(self.log, "leaving checkpoint loop for failover");
                self.ops.stop_replication(true);
                self.failover.complete();
            }
            ColoExitReason::Error => {
                error!(self.log, "checkpoint loop failed"; "error" => %err);
            }
        }
        self.ops.colo_exit(mode, reason);
    }

    fn process(
        &self,
        to_dst: &mut StreamWriter,
        from_dst: &mut StreamReader,
    ) -> Result<()> {
        self.ops.set_packet_filters(true)?;

        // Prime the stream: header and begin-phase sections, delimited so
        // the secondary can arm its section map before the first round.
        savevm::state_begin(self.reg, to_dst, &MigrationParams::default())?;
        to_dst.put_u8(crate::proto::EOF_MARKER);
        to_dst.flush()?;

        // Wait for the secondary to finish loading and enter restore.
        colo_get_check_cmd(from_dst, ColoCommand::CheckpointReady)?;

        let buffer = MemBuffer::new();

        self.ops.start_replication(ReplicationMode::Primary)?;
        self.vm.vm_start();
        info!(self.log, "checkpoint session established");

        let mut last_checkpoint = Instant::now();
        loop {
            if self.failover.active() {
                return Err(MigrateError::Cancelled);
            }

            let elapsed = last_checkpoint.elapsed();
            if elapsed < self.cfg.checkpoint_delay
                && !self.ops.shutdown_requested()
            {
                std::thread::sleep(self.cfg.checkpoint_delay - elapsed);
            }

            match self.checkpoint_transaction(to_dst, from_dst, &buffer)? {
                Round::Shutdown => return Ok(()),
                Round::Continue => {}
            }
            last_checkpoint = Instant::now();
        }
    }

    fn checkpoint_transaction(
        &self,
        to_dst: &mut StreamWriter,
        from_dst: &mut StreamReader,
        buffer: &MemBuffer,
    ) -> Result<Round> {
        colo_put_cmd(to_dst, ColoCommand::CheckpointRequest)?;

        buffer.clear();
        let mut trans = buffer.writer();

        if self.failover.active() {
            return Err(MigrateError::Cancelled);
        }
        let shutdown = self.ops.shutdown_requested();
        self.vm.vm_stop(RunState::Checkpoint);
        info!(self.log, "guest stopped for checkpoint");
        // A failover request can land while the guest is being stopped.
        if self.failover.active() {
            return Err(MigrateError::Cancelled);
        }

        self.ops.do_checkpoint()?;

        colo_put_cmd(to_dst, ColoCommand::VmstateSend)?;

        // Live state goes straight down the stream; device state is staged
        // in the buffer so its size can precede it.
        savevm::save_live_state(self.reg, to_dst)?;
        savevm::save_device_state(self.reg, &mut trans, self.vm)?;
        trans.flush()?;

        let size = buffer.len() as u64;
        colo_put_cmd_value(to_dst, ColoCommand::VmstateSize, size)?;
        to_dst.put_buffer(&buffer.snapshot());
        to_dst.flush()?;

        colo_get_check_cmd(from_dst, ColoCommand::VmstateReceived)?;
        colo_get_check_cmd(from_dst, ColoCommand::VmstateLoaded)?;

        self.ops.release_buffered_packets();

        if shutdown {
            self.ops.stop_replication(false);
            colo_put_cmd(to_dst, ColoCommand::GuestShutdown)?;
            to_dst.flush()?;
            self.ops.request_system_shutdown();
            info!(self.log, "guest shutdown shipped; leaving loop");
            return Ok(Round::Shutdown);
        }

        self.vm.vm_start();
        info!(self.log, "checkpoint complete; guest resumed";
            "vmstate_bytes" => size);
        Ok(Round::Continue)
    }
}

/// The secondary's side: receive and apply checkpoint rounds.
pub struct ColoSecondary<'a> {
    ops: &'a dyn ColoOps,
    failover: &'a FailoverArbiter,
    log: slog::Logger,
}

impl<'a> ColoSecondary<'a> {
    pub fn new(
        ops: &'a dyn ColoOps,
        failover: &'a FailoverArbiter,
        log: &slog::Logger,
    ) -> Self {
        Self {
            ops,
            failover,
            log: log.new(slog::o!("colo_mode" => "secondary")),
        }
    }

    /// Run the receive-and-apply loop.  `from_src` is the migration
    /// stream, `to_src` the return path toward the primary.
    pub fn run(
        &self,
        incoming: &mut Incoming<'_>,
        from_src: &mut StreamReader,
        to_src: &mut StreamWriter,
    ) -> Result<()> {
        let res = self.process(incoming, from_src, to_src);
        if let Err(err) = &res {
            let reason = if self.failover.active() {
                ColoExitReason::Request
            } else {
                ColoExitReason::Error
            };
            match reason {
                ColoExitReason::Request => {
                    info!(self.log, "leaving checkpoint loop for failover");
                    self.ops.stop_replication(true);
                    self.failover.complete();
                }
                ColoExitReason::Error => {
                    error!(self.log, "checkpoint loop failed";
                        "error" => %err);
                }
            }
            self.ops.colo_exit(ColoMode::Secondary, reason);
        }
        res
    }

    fn process(
        &self,
        incoming: &mut Incoming<'_>,
        from_src: &mut StreamReader,
        to_src: &mut StreamWriter,
    ) -> Result<()> {
        let vm = incoming.vm();
        let buffer = MemBuffer::new();

        // Consume the primary's begin bundle so the section map is armed
        // for every later round.
        incoming.load_begin(from_src)?;

        self.ops.start_replication(ReplicationMode::Secondary)?;
        colo_put_cmd(to_src, ColoCommand::CheckpointReady)?;
        info!(self.log, "ready for checkpoints");

        loop {
            match colo_get_cmd(from_src)? {
                ColoCommand::CheckpointRequest => {}
                ColoCommand::GuestShutdown => {
                    info!(self.log, "primary requested guest shutdown");
                    vm.vm_stop(RunState::Checkpoint);
                    self.ops.stop_replication(false);
                    self.ops.request_system_shutdown();
                    return Ok(());
                }
                other => {
                    return Err(MigrateError::ProtocolViolation(format!(
                        "unexpected checkpoint command {other:?}"
                    )));
                }
            }
            if self.failover.active() {
                return Err(MigrateError::Cancelled);
            }

            vm.vm_stop(RunState::Checkpoint);

            colo_get_check_cmd(from_src, ColoCommand::VmstateSend)?;
            incoming.load_ram_state(from_src)?;

            let size =
                colo_get_cmd_value(from_src, ColoCommand::VmstateSize)?;
            let bytes = from_src.get_buffer(size as usize)?;
            buffer.fill(bytes);

            colo_put_cmd(to_src, ColoCommand::VmstateReceived)?;

            // Apply the device buffer with failover deferred: a takeover
            // request that lands now parks until the load is consistent.
            vm.system_reset();
            self.failover.set_loading(true);
            let applied = (|| {
                let mut fb = buffer.reader();
                incoming.load_device_state(&mut fb)?;
                self.ops.do_checkpoint()
            })();
            self.failover.set_loading(false);
            applied?;

            if self.failover.take_relaunch() {
                return Err(MigrateError::Cancelled);
            }

            colo_put_cmd(to_src, ColoCommand::VmstateLoaded)?;
            vm.vm_start();
            info!(self.log, "checkpoint applied; guest resumed";
                "vmstate_bytes" => size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamMap;
    use crate::registry::FullState;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn null_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[derive(Default)]
    struct MockVm {
        stops: AtomicUsize,
        starts: AtomicUsize,
        resets: AtomicUsize,
    }
    impl VmControl for MockVm {
        fn vm_stop(&self, _s: RunState) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn vm_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn cpu_synchronize_states(&self) {}
        fn cpu_synchronize_post_init(&self) {}
        fn system_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockOps {
        events: Mutex<Vec<String>>,
        exits: Mutex<Vec<(ColoMode, ColoExitReason)>>,
        shutdown: AtomicBool,
    }
    impl MockOps {
        fn record(&self, ev: &str) {
            self.events.lock().unwrap().push(ev.to_string());
        }
    }
    impl ColoOps for MockOps {
        fn start_replication(&self, mode: ReplicationMode) -> Result<()> {
            self.record(&format!("start_replication:{mode:?}"));
            Ok(())
        }
        fn stop_replication(&self, failover: bool) {
            self.record(&format!("stop_replication:{failover}"));
        }
        fn do_checkpoint(&self) -> Result<()> {
            self.record("checkpoint");
            Ok(())
        }
        fn set_packet_filters(&self, buffering: bool) -> Result<()> {
            self.record(&format!("filters:{buffering}"));
            Ok(())
        }
        fn release_buffered_packets(&self) {
            self.record("release_packets");
        }
        fn shutdown_requested(&self) -> bool {
            self.shutdown.load(Ordering::SeqCst)
        }
        fn request_system_shutdown(&self) {
            self.record("system_shutdown");
        }
        fn colo_exit(&self, mode: ColoMode, reason: ColoExitReason) {
            self.exits.lock().unwrap().push((mode, reason));
        }
    }

    struct Probe {
        loads: AtomicUsize,
    }
    impl FullState for Probe {
        fn save(&self, w: &mut StreamWriter) -> Result<()> {
            w.put_be32(0x600D_5EED);
            Ok(())
        }
        fn load(&self, r: &mut StreamReader, _v: u32) -> Result<()> {
            assert_eq!(r.get_be32()?, 0x600D_5EED);
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn arbiter_parks_requests_during_load() {
        let arb = FailoverArbiter::new();
        assert!(!arb.active());

        arb.set_loading(true);
        arb.request();
        assert_eq!(arb.state(), FailoverStatus::Relaunch);
        assert!(arb.active());

        arb.set_loading(false);
        assert!(arb.take_relaunch());
        assert_eq!(arb.state(), FailoverStatus::Require);
        assert!(!arb.take_relaunch());
    }

    #[test]
    fn arbiter_request_is_idempotent() {
        let arb = FailoverArbiter::new();
        arb.request();
        arb.request();
        assert_eq!(arb.state(), FailoverStatus::Require);
        arb.complete();
        arb.request();
        assert_eq!(arb.state(), FailoverStatus::Completed);
    }

    #[test]
    fn primary_failover_request_exits_with_request_reason() {
        let mut reg = Registry::init();
        reg.register(None, "dev", 0, 1, Arc::new(Probe { loads: AtomicUsize::new(0) }));
        let vm = MockVm::default();
        let ops = MockOps::default();
        let failover = FailoverArbiter::new();
        failover.request();

        let primary = ColoPrimary::new(
            &reg,
            &vm,
            &ops,
            &failover,
            ColoConfig { checkpoint_delay: Duration::from_millis(0) },
            &null_log(),
        );

        let to_dst = MemBuffer::new();
        let mut w = to_dst.writer();
        // Scripted return path: the secondary reports ready, then the
        // failover request (already pending) stops the loop.
        let rp = MemBuffer::new();
        {
            let mut rp_w = rp.writer();
            colo_put_cmd(&mut rp_w, ColoCommand::CheckpointReady).unwrap();
        }
        let mut r = rp.reader();

        assert_eq!(primary.run(&mut w, &mut r), Err(MigrateError::Cancelled));
        assert_eq!(
            ops.exits.lock().unwrap().as_slice(),
            &[(ColoMode::Primary, ColoExitReason::Request)]
        );
        assert!(ops
            .events
            .lock()
            .unwrap()
            .contains(&"stop_replication:true".to_string()));
        assert_eq!(failover.state(), FailoverStatus::Completed);
    }

    #[test]
    fn primary_transaction_wire_sequence() {
        let mut reg = Registry::init();
        reg.register(None, "dev", 0, 1, Arc::new(Probe { loads: AtomicUsize::new(0) }));
        let vm = MockVm::default();
        let ops = MockOps::default();
        let failover = FailoverArbiter::new();
        let primary = ColoPrimary::new(
            &reg,
            &vm,
            &ops,
            &failover,
            ColoConfig::default(),
            &null_log(),
        );

        let to_dst = MemBuffer::new();
        let mut w = to_dst.writer();
        let rp = MemBuffer::new();
        {
            let mut rp_w = rp.writer();
            colo_put_cmd(&mut rp_w, ColoCommand::VmstateReceived).unwrap();
            colo_put_cmd(&mut rp_w, ColoCommand::VmstateLoaded).unwrap();
        }
        let mut r = rp.reader();
        let buffer = MemBuffer::new();

        assert!(matches!(
            primary.checkpoint_transaction(&mut w, &mut r, &buffer),
            Ok(Round::Continue)
        ));
        assert_eq!(vm.stops.load(Ordering::SeqCst), 1);
        assert_eq!(vm.starts.load(Ordering::SeqCst), 1);

        // Wire: CheckpointRequest, VmstateSend, live EOF, VmstateSize+len,
        // then the device buffer verbatim.
        let mut out = to_dst.reader();
        assert_eq!(
            out.get_be32().unwrap(),
            u32::from(ColoCommand::CheckpointRequest)
        );
        assert_eq!(
            out.get_be32().unwrap(),
            u32::from(ColoCommand::VmstateSend)
        );
        assert_eq!(out.get_u8().unwrap(), crate::proto::EOF_MARKER);
        assert_eq!(
            out.get_be32().unwrap(),
            u32::from(ColoCommand::VmstateSize)
        );
        let size = out.get_be64().unwrap();
        assert_eq!(size as usize, buffer.len());
        assert_eq!(out.get_buffer(size as usize).unwrap(), buffer.snapshot());
    }

    #[test]
    fn secondary_applies_rounds_until_shutdown() {
        let mut reg = Registry::init();
        let probe = Arc::new(Probe { loads: AtomicUsize::new(0) });
        reg.register(None, "dev", 0, 1, probe.clone());
        let vm = MockVm::default();
        let ops = MockOps::default();
        let failover = FailoverArbiter::new();

        // Script the primary's stream: begin bundle, one checkpoint round,
        // then a shutdown command.
        let stream = MemBuffer::new();
        {
            let mut w = stream.writer();
            savevm::state_begin(&reg, &mut w, &MigrationParams::default())
                .unwrap();
            w.put_u8(crate::proto::EOF_MARKER);
            w.flush().unwrap();

            colo_put_cmd(&mut w, ColoCommand::CheckpointRequest).unwrap();
            colo_put_cmd(&mut w, ColoCommand::VmstateSend).unwrap();
            savevm::save_live_state(&reg, &mut w).unwrap();

            let devbuf = MemBuffer::new();
            let mut trans = devbuf.writer();
            savevm::save_device_state(&reg, &mut trans, &vm).unwrap();
            colo_put_cmd_value(
                &mut w,
                ColoCommand::VmstateSize,
                devbuf.len() as u64,
            )
            .unwrap();
            w.put_buffer(&devbuf.snapshot());
            w.flush().unwrap();

            colo_put_cmd(&mut w, ColoCommand::GuestShutdown).unwrap();
        }

        let ram = Arc::new(RamMap::new());
        let mut incoming =
            Incoming::new(&reg, &vm, ram, null_log());
        let secondary = ColoSecondary::new(&ops, &failover, &null_log());

        let mut from_src = stream.reader();
        let to_src = MemBuffer::new();
        let mut w = to_src.writer();
        secondary.run(&mut incoming, &mut from_src, &mut w).unwrap();

        // The round applied the device state exactly once.
        assert_eq!(probe.loads.load(Ordering::SeqCst), 1);
        assert_eq!(vm.resets.load(Ordering::SeqCst), 1);

        // Acks went back in order.
        let mut acks = to_src.reader();
        for expect in [
            ColoCommand::CheckpointReady,
            ColoCommand::VmstateReceived,
            ColoCommand::VmstateLoaded,
        ] {
            assert_eq!(acks.get_be32().unwrap(), u32::from(expect));
        }

        // Shutdown path ran and no exit event fired (clean return).
        assert!(ops
            .events
            .lock()
            .unwrap()
            .contains(&"system_shutdown".to_string()));
        assert!(ops.exits.lock().unwrap().is_empty());
    }

    #[test]
    fn secondary_relaunch_after_parked_failover() {
        let reg = Registry::init();
        let vm = MockVm::default();
        let ops = MockOps::default();
        let failover = FailoverArbiter::new();

        // Park a request as if it arrived mid-load, then let the secondary
        // observe it at the next checkpoint boundary.
        failover.set_loading(true);
        failover.request();
        failover.set_loading(false);

        let stream = MemBuffer::new();
        {
            let mut w = stream.writer();
            savevm::state_begin(&reg, &mut w, &MigrationParams::default())
                .unwrap();
            w.put_u8(crate::proto::EOF_MARKER);
            w.flush().unwrap();
            colo_put_cmd(&mut w, ColoCommand::CheckpointRequest).unwrap();
        }

        let ram = Arc::new(RamMap::new());
        let mut incoming = Incoming::new(&reg, &vm, ram, null_log());
        let secondary = ColoSecondary::new(&ops, &failover, &null_log());

        let mut from_src = stream.reader();
        let to_src = MemBuffer::new();
        let mut w = to_src.writer();
        assert_eq!(
            secondary.run(&mut incoming, &mut from_src, &mut w),
            Err(MigrateError::Cancelled)
        );
        assert_eq!(
            ops.exits.lock().unwrap().as_slice(),
            &[(ColoMode::Secondary, ColoExitReason::Request)]
        );
        assert_eq!(failover.state(), FailoverStatus::Completed);
    }
}
