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

// This module implements some operations of Rust primitive types.

/// Calculate the aligned-up u64 value.
///
/// # Arguments
///
/// * `origin` - the origin value.
/// * `align` - the alignment.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::round_up;
///
/// let value = round_up(1003 as u64, 4 as u64);
/// assert!(value == Some(1004));
/// ```
pub fn round_up(origin: u64, align: u64) -> Option<u64> {
    match origin % align {
        0 => Some(origin),
        diff => origin.checked_add(align - diff),
    }
}

/// Calculate the aligned-down u64 value.
///
/// # Arguments
///
/// * `origin` - the origin value.
/// * `align` - the alignment.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::round_down;
///
/// let value = round_down(1003 as u64, 4 as u64);
/// assert!(value == Some(1000));
/// ```
pub fn round_down(origin: u64, align: u64) -> Option<u64> {
    match origin % align {
        0 => Some(origin),
        diff => origin.checked_sub(diff),
    }
}

/// Divide and round up.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::div_round_up;
///
/// assert_eq!(div_round_up(4097, 4096), Some(2));
/// assert_eq!(div_round_up(1, 0), None);
/// ```
pub fn div_round_up(dividend: u64, divisor: u64) -> Option<u64> {
    if divisor == 0 {
        return None;
    }
    let quotient = dividend / divisor;
    if dividend % divisor == 0 {
        Some(quotient)
    } else {
        quotient.checked_add(1)
    }
}

/// Return the largest power of 2 not bigger than `value`, 0 for 0.
pub fn pow2_floor(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    1 << (63 - value.leading_zeros())
}

/// Return log2 of `value` if it's a power of 2.
pub fn log2_exact(value: u64) -> Option<u32> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_up_test() {
        let result = round_up(10001_u64, 100_u64);
        assert_eq!(result, Some(10100));
        assert_eq!(round_up(u64::MAX, 4096), None);
    }

    #[test]
    fn round_down_test() {
        let result = round_down(10001_u64, 100_u64);
        assert_eq!(result, Some(10000));
    }

    #[test]
    fn test_pow2_helpers() {
        assert_eq!(pow2_floor(0), 0);
        assert_eq!(pow2_floor(1), 1);
        assert_eq!(pow2_floor(6000), 4096);
        assert_eq!(pow2_floor(1 << 40), 1 << 40);
        assert_eq!(log2_exact(4096), Some(12));
        assert_eq!(log2_exact(4095), None);
    }
}
