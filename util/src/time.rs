// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
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
use nix::time::{clock_gettime, ClockId};

use crate::UtilError;

pub const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Get the realtime clock as (seconds, nanoseconds).
pub fn gettime() -> Result<(u64, u64)> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME)
        .map_err(|e| anyhow!(UtilError::GetTime(e.to_string())))?;
    Ok((ts.tv_sec() as u64, ts.tv_nsec() as u64))
}

/// Split seconds since epoch into local [year, month, day, hour, minute, second].
pub fn get_format_time(sec: i64) -> [i32; 6] {
    // SAFETY: tm is plain old data and fully written by localtime_r.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let time: libc::time_t = sec as libc::time_t;
    // SAFETY: both pointers are valid for the duration of the call.
    unsafe { libc::localtime_r(&time, &mut tm) };

    [
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_time() {
        let (sec, nsec) = gettime().unwrap();
        assert!(sec > 0);
        assert!(nsec < NANOSECONDS_PER_SECOND);

        let fmt = get_format_time(sec as i64);
        assert!(fmt[0] >= 1970);
        assert!((1..=12).contains(&fmt[1]));
        assert!((1..=31).contains(&fmt[2]));
    }
}
