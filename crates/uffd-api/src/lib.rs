// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw definitions for the Linux userfaultfd ABI.
//!
//! Constants and structures from `linux/userfaultfd.h`, for callers that
//! drive the fd directly with `libc::ioctl`.  No policy lives here.

mod ioctls;
mod structs;

pub use ioctls::*;
pub use structs::*;

/// Version handshake value passed in `uffdio_api.api`.
pub const UFFD_API: u64 = 0xAA;

/// Flags accepted by the `userfaultfd` syscall.
pub const UFFD_FLAGS_CLOEXEC: libc::c_int = libc::O_CLOEXEC;
pub const UFFD_FLAGS_NONBLOCK: libc::c_int = libc::O_NONBLOCK;

/// Open a new userfault fd.  Returns the raw fd, or -1 with errno set.
///
/// # Safety
///
/// Thin syscall wrapper; the caller owns the returned fd.
#[cfg(target_os = "linux")]
pub unsafe fn userfaultfd(flags: libc::c_int) -> libc::c_int {
    libc::syscall(libc::SYS_userfaultfd, flags) as libc::c_int
}
