// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(non_camel_case_types)]

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct uffdio_api {
    /// Requested API version; UFFD_API is the only one defined.
    pub api: u64,
    pub features: u64,
    /// Out: bitmask of supported `_UFFDIO_*` operations.
    pub ioctls: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct uffdio_range {
    pub start: u64,
    pub len: u64,
}

pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
pub const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct uffdio_register {
    pub range: uffdio_range,
    pub mode: u64,
    /// Out: operations supported on the registered range.
    pub ioctls: u64,
}

/// Do not wake the faulting thread after the copy completes.
pub const UFFDIO_COPY_MODE_DONTWAKE: u64 = 1 << 0;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct uffdio_copy {
    pub dst: u64,
    pub src: u64,
    pub len: u64,
    pub mode: u64,
    /// Out: bytes copied, or negated errno.
    pub copy: i64,
}

pub const UFFDIO_ZEROPAGE_MODE_DONTWAKE: u64 = 1 << 0;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct uffdio_zeropage {
    pub range: uffdio_range,
    pub mode: u64,
    /// Out: bytes zeroed, or negated errno.
    pub zeropage: i64,
}
