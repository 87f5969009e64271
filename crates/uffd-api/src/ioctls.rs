// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Define constants from linux/userfaultfd.h

use crate::structs::*;

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u64, nr: u64, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
        | (ty << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

const fn ior(ty: u64, nr: u64, size: usize) -> u64 {
    ioc(IOC_READ, ty, nr, size)
}

const fn iowr(ty: u64, nr: u64, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// Ioctl "type" octet for the userfaultfd family.
pub const UFFDIO: u64 = 0xAA;

// Per-operation numbers; these double as bit positions in the `ioctls`
// capability masks reported by UFFDIO_API and UFFDIO_REGISTER.
pub const _UFFDIO_REGISTER: u64 = 0x00;
pub const _UFFDIO_UNREGISTER: u64 = 0x01;
pub const _UFFDIO_WAKE: u64 = 0x02;
pub const _UFFDIO_COPY: u64 = 0x03;
pub const _UFFDIO_ZEROPAGE: u64 = 0x04;
pub const _UFFDIO_API: u64 = 0x3F;

pub const UFFDIO_API: u64 =
    iowr(UFFDIO, _UFFDIO_API, std::mem::size_of::<uffdio_api>());
pub const UFFDIO_REGISTER: u64 =
    iowr(UFFDIO, _UFFDIO_REGISTER, std::mem::size_of::<uffdio_register>());
pub const UFFDIO_UNREGISTER: u64 =
    ior(UFFDIO, _UFFDIO_UNREGISTER, std::mem::size_of::<uffdio_range>());
pub const UFFDIO_WAKE: u64 =
    ior(UFFDIO, _UFFDIO_WAKE, std::mem::size_of::<uffdio_range>());
pub const UFFDIO_COPY: u64 =
    iowr(UFFDIO, _UFFDIO_COPY, std::mem::size_of::<uffdio_copy>());
pub const UFFDIO_ZEROPAGE: u64 =
    iowr(UFFDIO, _UFFDIO_ZEROPAGE, std::mem::size_of::<uffdio_zeropage>());
