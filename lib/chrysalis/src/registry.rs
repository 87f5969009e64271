// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of per-device state entries.
//!
//! Every migratable producer registers one entry here during construction.
//! The registry's insertion order is the stream's transmit order; the
//! registry is read-only once a migration has begun.

use std::sync::Arc;

use crate::error::{MigrateError, MigrateStateError, Result, VersionError};
use crate::stream::{StreamReader, StreamWriter};
use crate::MigrationParams;

/// Request automatic instance-id assignment at registration time.
pub const AUTO_INSTANCE: i32 = -1;

/// Outcome of one round of an iterative transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IterateStatus {
    /// More data remains; call again.
    Again,
    /// This entry has nothing further to send.
    Done,
}

/// Whole-state producer: everything in one FULL section at completion.
pub trait FullState: Send + Sync {
    fn save(&self, w: &mut StreamWriter) -> Result<()>;
    fn load(&self, r: &mut StreamReader, version_id: u32) -> Result<()>;
}

/// Iterative producer (guest RAM, dirty block bitmaps): transfers in rounds
/// across START/PART/END sections while the guest keeps running.
pub trait LiveState: Send + Sync {
    /// Observe the migration parameters before the begin phase.
    fn set_params(&self, _params: &MigrationParams) {}

    /// Inactive entries are skipped by every phase.
    fn is_active(&self) -> bool {
        true
    }

    /// Write the initial blob into the entry's START section.
    fn setup(&self, w: &mut StreamWriter) -> Result<()>;

    /// Write one PART round.  Returning [`IterateStatus::Done`] means a
    /// subsequent round would have nothing to add.
    fn iterate(&self, w: &mut StreamWriter) -> Result<IterateStatus>;

    /// Write the final blob into the entry's END section.
    fn complete(&self, w: &mut StreamWriter) -> Result<()>;

    /// Estimate of bytes still to be transferred, for scheduling the
    /// completion (or postcopy flip) point.
    fn pending(&self, _max_size: u64) -> u64 {
        0
    }

    /// Whether this entry can finish after execution flips to the
    /// destination.
    fn can_postcopy(&self) -> bool {
        false
    }

    fn cancel(&self) {}

    /// Consume one section payload on the destination.
    fn load(&self, r: &mut StreamReader, version_id: u32) -> Result<()>;
}

/// Static description of a schema-driven entry.
#[derive(Debug)]
pub struct VmStateDescription {
    pub name: &'static str,
    pub version_id: u32,
    pub minimum_version_id: u32,
    /// Declares the owning device non-migratable; its presence blocks every
    /// save and load.
    pub unmigratable: bool,
}

/// Structured-state access for schema entries.  The exported value is
/// serialized by the engine; the device never touches the stream itself.
pub trait VmStateData: Send + Sync {
    /// Return a serialization of the current device state.
    fn export(&self) -> Box<dyn erased_serde::Serialize>;

    /// Update the current device state from the given deserializer.
    fn import(
        &self,
        dev: &str,
        _deserializer: &mut dyn erased_serde::Deserializer<'_>,
        _version_id: u32,
    ) -> std::result::Result<(), MigrateStateError> {
        Err(MigrateStateError::ImportUnimplemented(dev.to_string()))
    }
}

/// The serialization mechanism an entry registered with.
#[derive(Clone)]
pub enum EntryOps {
    /// Legacy save/load callback pair.
    Full(Arc<dyn FullState>),
    /// Iterative live hooks.
    Live(Arc<dyn LiveState>),
    /// Structured schema walked by the engine.
    Schema { desc: &'static VmStateDescription, data: Arc<dyn VmStateData> },
}

impl EntryOps {
    fn opaque(&self) -> OpaqueToken {
        match self {
            EntryOps::Full(ops) => token(ops),
            EntryOps::Live(ops) => token(ops),
            EntryOps::Schema { data, .. } => token(data),
        }
    }

    fn live(&self) -> Option<&dyn LiveState> {
        match self {
            EntryOps::Live(ops) => Some(&**ops),
            _ => None,
        }
    }
}

/// Identity of a registered producer, used to target `unregister` at the
/// entries a particular object owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpaqueToken(*const ());

// The pointer is never dereferenced; it is an identity cookie.
unsafe impl Send for OpaqueToken {}
unsafe impl Sync for OpaqueToken {}

/// Identity token for the object behind `arc`.
pub fn token<T: ?Sized>(arc: &Arc<T>) -> OpaqueToken {
    OpaqueToken(Arc::as_ptr(arc) as *const ())
}

/// Identifier the entry was known by before its owner gained a device path
/// prefix; lets streams from older producers still find it.
struct CompatEntry {
    idstr: String,
    instance_id: i32,
}

pub struct StateEntry {
    idstr: String,
    instance_id: i32,
    alias_id: Option<i32>,
    version_id: u32,
    section_id: u32,
    ops: EntryOps,
    is_ram: bool,
    compat: Option<CompatEntry>,
}

impl StateEntry {
    pub fn idstr(&self) -> &str {
        &self.idstr
    }

    pub fn instance_id(&self) -> i32 {
        self.instance_id
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn section_id(&self) -> u32 {
        self.section_id
    }

    pub fn is_ram(&self) -> bool {
        self.is_ram
    }

    pub(crate) fn ops(&self) -> &EntryOps {
        &self.ops
    }

    pub(crate) fn live_ops(&self) -> Option<&dyn LiveState> {
        self.ops.live()
    }

    /// Whether completion emits a FULL section for this entry.
    pub(crate) fn has_full_section(&self) -> bool {
        matches!(self.ops, EntryOps::Full(_) | EntryOps::Schema { .. })
    }

    /// Write this entry's whole-state payload (FULL section body).
    pub(crate) fn save_full(&self, w: &mut StreamWriter) -> Result<()> {
        match &self.ops {
            EntryOps::Full(ops) => ops.save(w),
            EntryOps::Schema { data, .. } => {
                let payload = data.export();
                let text = ron::ser::to_string(&payload).map_err(|e| {
                    MigrateError::from(MigrateStateError::ExportFailed(
                        e.to_string(),
                    ))
                })?;
                w.put_be32(text.len() as u32);
                w.put_buffer(text.as_bytes());
                Ok(())
            }
            EntryOps::Live(_) => Ok(()),
        }
    }

    /// Dispatch one section payload to the entry's loader.
    pub(crate) fn load_section(
        &self,
        r: &mut StreamReader,
        version_id: u32,
    ) -> Result<()> {
        match &self.ops {
            EntryOps::Full(ops) => ops.load(r, version_id),
            EntryOps::Live(ops) => ops.load(r, version_id),
            EntryOps::Schema { desc, data } => {
                if version_id < desc.minimum_version_id {
                    return Err(MigrateError::UnsupportedVersion(
                        VersionError::Section {
                            idstr: self.idstr.clone(),
                            wire: version_id,
                            supported: desc.minimum_version_id,
                        },
                    ));
                }
                let len = r.get_be32()? as usize;
                let bytes = r.get_buffer(len)?;
                let text = String::from_utf8(bytes).map_err(|_| {
                    MigrateError::Format(format!(
                        "schema payload for '{}' is not UTF-8",
                        self.idstr
                    ))
                })?;
                let mut de = ron::Deserializer::from_str(&text)
                    .map_err(|e| {
                        MigrateStateError::ImportDeserialization(
                            e.to_string(),
                        )
                    })?;
                let de = &mut <dyn erased_serde::Deserializer>::erase(&mut de);
                data.import(&self.idstr, de, version_id)?;
                Ok(())
            }
        }
    }
}

/// Ordered set of state entries plus the process-wide section-id counter.
///
/// There are no implicit singletons; construct one with [`Registry::init`]
/// and pass it by reference.  Section ids stay strictly increasing across
/// unregistration, so a later session never reuses an earlier session's id.
#[derive(Default)]
pub struct Registry {
    entries: Vec<StateEntry>,
    next_section_id: u32,
}

impl Registry {
    pub fn init() -> Self {
        Self::default()
    }

    /// Tear down the registry, dropping every entry.
    pub fn shutdown(self) {}

    fn next_instance_id(&self, idstr: &str) -> i32 {
        let mut instance_id = 0;
        for e in &self.entries {
            if e.idstr == idstr && instance_id <= e.instance_id {
                instance_id = e.instance_id + 1;
            }
        }
        instance_id
    }

    fn next_compat_instance_id(&self, idstr: &str) -> i32 {
        let mut instance_id = 0;
        for e in &self.entries {
            if let Some(compat) = &e.compat {
                if compat.idstr == idstr && instance_id <= compat.instance_id
                {
                    instance_id = compat.instance_id + 1;
                }
            }
        }
        instance_id
    }

    fn register_common(
        &mut self,
        device: Option<&str>,
        idstr: &str,
        mut instance_id: i32,
        version_id: u32,
        alias_id: Option<i32>,
        ops: EntryOps,
        is_ram: bool,
    ) -> u32 {
        assert!(idstr.len() < 256, "identifier too long: {idstr}");

        let mut effective = String::new();
        let mut compat = None;
        if let Some(path) = device {
            effective.push_str(path);
            effective.push('/');
            compat = Some(CompatEntry {
                idstr: idstr.to_string(),
                instance_id: if instance_id == AUTO_INSTANCE {
                    self.next_compat_instance_id(idstr)
                } else {
                    instance_id
                },
            });
            instance_id = AUTO_INSTANCE;
        }
        effective.push_str(idstr);
        assert!(effective.len() < 256, "identifier too long: {effective}");

        if instance_id == AUTO_INSTANCE {
            instance_id = self.next_instance_id(&effective);
        }
        debug_assert!(compat.is_none() || instance_id == 0);

        let section_id = self.next_section_id;
        self.next_section_id += 1;

        self.entries.push(StateEntry {
            idstr: effective,
            instance_id,
            alias_id,
            version_id,
            section_id,
            ops,
            is_ram,
            compat,
        });
        section_id
    }

    /// Register a legacy callback-pair entry.  Returns the assigned section
    /// id.
    pub fn register(
        &mut self,
        device: Option<&str>,
        idstr: &str,
        instance_id: i32,
        version_id: u32,
        ops: Arc<dyn FullState>,
    ) -> u32 {
        self.register_common(
            device,
            idstr,
            instance_id,
            version_id,
            None,
            EntryOps::Full(ops),
            false,
        )
    }

    /// Register an iterative (live) entry.
    pub fn register_live(
        &mut self,
        device: Option<&str>,
        idstr: &str,
        instance_id: i32,
        version_id: u32,
        ops: Arc<dyn LiveState>,
    ) -> u32 {
        self.register_common(
            device,
            idstr,
            instance_id,
            version_id,
            None,
            EntryOps::Live(ops),
            true,
        )
    }

    /// Register a schema-driven entry.  `alias_id` additionally matches the
    /// instance id older streams may carry for this entry.
    pub fn register_schema(
        &mut self,
        device: Option<&str>,
        instance_id: i32,
        desc: &'static VmStateDescription,
        data: Arc<dyn VmStateData>,
        alias_id: Option<i32>,
    ) -> u32 {
        self.register_common(
            device,
            desc.name,
            instance_id,
            desc.version_id,
            alias_id,
            EntryOps::Schema { desc, data },
            false,
        )
    }

    /// Remove every entry matching the effective identifier and the
    /// registering object's identity token.
    pub fn unregister(
        &mut self,
        device: Option<&str>,
        idstr: &str,
        opaque: OpaqueToken,
    ) {
        let mut effective = String::new();
        if let Some(path) = device {
            effective.push_str(path);
            effective.push('/');
        }
        effective.push_str(idstr);

        self.entries
            .retain(|e| e.idstr != effective || e.ops.opaque() != opaque);
    }

    /// Locate the entry an incoming section header refers to.
    ///
    /// Exact identifier matches are tried first (against the instance id or
    /// the alias id); otherwise a substring match against the compat record
    /// supports streams from producers that predate device-path prefixes.
    pub fn find(&self, idstr: &str, instance_id: i32) -> Option<&StateEntry> {
        for e in &self.entries {
            if e.idstr == idstr
                && (instance_id == e.instance_id
                    || Some(instance_id) == e.alias_id)
            {
                return Some(e);
            }
            if let Some(compat) = &e.compat {
                if e.idstr.contains(idstr)
                    && compat.idstr == idstr
                    && (instance_id == compat.instance_id
                        || Some(instance_id) == e.alias_id)
                {
                    return Some(e);
                }
            }
        }
        None
    }

    /// If any entry declares itself non-migratable, name the offender.
    pub fn blocked(&self) -> Option<&str> {
        self.entries.iter().find_map(|e| match &e.ops {
            EntryOps::Schema { desc, .. } if desc.unmigratable => {
                Some(e.idstr.as_str())
            }
            _ => None,
        })
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullState;
    impl FullState for NullState {
        fn save(&self, _w: &mut StreamWriter) -> Result<()> {
            Ok(())
        }
        fn load(&self, _r: &mut StreamReader, _v: u32) -> Result<()> {
            Ok(())
        }
    }

    fn null() -> Arc<dyn FullState> {
        Arc::new(NullState)
    }

    #[test]
    fn section_ids_are_monotonic() {
        let mut reg = Registry::init();
        let a = reg.register(None, "a", 0, 1, null());
        let b = reg.register(None, "b", 0, 1, null());
        let ops = null();
        let c = reg.register(None, "c", 0, 1, ops.clone());
        assert!(a < b && b < c);

        // Unregistration never lowers the high-water mark.
        reg.unregister(None, "c", token(&ops));
        let d = reg.register(None, "d", 0, 1, null());
        assert!(d > c);
    }

    #[test]
    fn auto_instance_assignment() {
        let mut reg = Registry::init();
        reg.register(None, "serial", AUTO_INSTANCE, 1, null());
        reg.register(None, "serial", AUTO_INSTANCE, 1, null());
        reg.register(None, "serial", 7, 1, null());
        reg.register(None, "serial", AUTO_INSTANCE, 1, null());

        assert!(reg.find("serial", 0).is_some());
        assert!(reg.find("serial", 1).is_some());
        assert!(reg.find("serial", 7).is_some());
        // One past the maximum existing instance.
        assert!(reg.find("serial", 8).is_some());
        assert!(reg.find("serial", 2).is_none());
    }

    #[test]
    fn device_prefix_and_compat_find() {
        let mut reg = Registry::init();
        reg.register(Some("pci@0:3"), "nic", AUTO_INSTANCE, 2, null());

        let e = reg.find("pci@0:3/nic", 0).expect("effective id");
        assert_eq!(e.instance_id(), 0);

        // Older streams carry only the bare name.
        let e = reg.find("nic", 0).expect("compat id");
        assert_eq!(e.idstr(), "pci@0:3/nic");
    }

    #[test]
    fn alias_instance_matches() {
        static DESC: VmStateDescription = VmStateDescription {
            name: "timer",
            version_id: 2,
            minimum_version_id: 1,
            unmigratable: false,
        };
        struct Data;
        impl VmStateData for Data {
            fn export(&self) -> Box<dyn erased_serde::Serialize> {
                Box::new(0u32)
            }
        }
        let mut reg = Registry::init();
        reg.register_schema(None, 3, &DESC, Arc::new(Data), Some(99));
        assert!(reg.find("timer", 3).is_some());
        assert!(reg.find("timer", 99).is_some());
        assert!(reg.find("timer", 4).is_none());
    }

    #[test]
    fn unregister_matches_identity() {
        let mut reg = Registry::init();
        let keep = null();
        let drop_me = null();
        reg.register(None, "dev", 0, 1, keep.clone());
        reg.register(None, "dev", 1, 1, drop_me.clone());

        reg.unregister(None, "dev", token(&drop_me));
        assert!(reg.find("dev", 0).is_some());
        assert!(reg.find("dev", 1).is_none());
    }

    #[test]
    fn unique_identifier_instance_pairs() {
        let mut reg = Registry::init();
        reg.register(None, "disk", AUTO_INSTANCE, 1, null());
        reg.register(None, "disk", AUTO_INSTANCE, 1, null());
        reg.register(Some("pci@0:4"), "disk", AUTO_INSTANCE, 1, null());

        let mut seen = std::collections::HashSet::new();
        for e in reg.entries() {
            assert!(seen.insert((e.idstr().to_string(), e.instance_id())));
        }
    }

    #[test]
    fn blocked_names_the_offender() {
        static DESC: VmStateDescription = VmStateDescription {
            name: "legacy-fdc",
            version_id: 1,
            minimum_version_id: 1,
            unmigratable: true,
        };
        struct Data;
        impl VmStateData for Data {
            fn export(&self) -> Box<dyn erased_serde::Serialize> {
                Box::new(())
            }
        }
        let mut reg = Registry::init();
        assert!(reg.blocked().is_none());
        reg.register_schema(None, 0, &DESC, Arc::new(Data), None);
        assert_eq!(reg.blocked(), Some("legacy-fdc"));
    }
}
