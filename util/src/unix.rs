// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use anyhow::{anyhow, Result};

use crate::UtilError;

/// Gets the page size of host.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no side effect.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Map anonymous private memory of `len` bytes, return the host address.
///
/// # Arguments
///
/// * `len` - Length of the mapping.
/// * `dump_guest_core` - Include the mapping in core dumps or not.
pub fn do_mmap(len: u64, dump_guest_core: bool) -> Result<u64> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

    // SAFETY: a new anonymous mapping does not alias any existing memory.
    let hva = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len as libc::size_t,
            prot,
            flags,
            -1,
            0,
        )
    };
    if hva == libc::MAP_FAILED {
        return Err(anyhow!(UtilError::BadSyscall(std::io::Error::last_os_error())));
    }

    if !dump_guest_core {
        madvise(hva as u64, len, libc::MADV_DONTDUMP)?;
    }

    Ok(hva as u64)
}

/// Unmap memory mapped by `do_mmap`.
pub fn do_munmap(addr: u64, len: u64) -> Result<()> {
    // SAFETY: the caller owns the mapping and never touches it afterwards.
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len as libc::size_t) };
    if ret != 0 {
        return Err(anyhow!(UtilError::BadSyscall(std::io::Error::last_os_error())));
    }
    Ok(())
}

/// Give advice about use of memory.
pub fn madvise(addr: u64, len: u64, advice: libc::c_int) -> Result<()> {
    // SAFETY: madvise only changes kernel bookkeeping of the range.
    let ret = unsafe { libc::madvise(addr as *mut libc::c_void, len as libc::size_t, advice) };
    if ret != 0 {
        return Err(anyhow!(UtilError::BadSyscall(std::io::Error::last_os_error())));
    }
    Ok(())
}
