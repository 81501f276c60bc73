// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use nix::time::{clock_gettime, ClockId};

/// Current wall-clock time in microseconds.
///
/// This and [`now_nsec`] are the only time sources used by the library.
pub fn now_usec() -> Result<i64> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME)
        .map_err(|e| Error::Runtime(format!("clock_gettime() failed: {e}")))?;
    Ok(ts.tv_sec() * 1_000_000 + ts.tv_nsec() / 1_000)
}

/// Current wall-clock time in nanoseconds.
pub fn now_nsec() -> Result<i64> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME)
        .map_err(|e| Error::Runtime(format!("clock_gettime() failed: {e}")))?;
    Ok(ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_usec_moves_forward() {
        let a = now_usec().unwrap();
        let b = now_usec().unwrap();
        assert!(b >= a);
        // sanity: after 2020-01-01 in microseconds
        assert!(a > 1_577_836_800_000_000);
    }

    #[test]
    fn test_now_nsec_matches_usec_scale() {
        let us = now_usec().unwrap();
        let ns = now_nsec().unwrap();
        let diff = ns / 1_000 - us;
        assert!(diff.abs() < 5_000_000, "clocks diverge: {diff}us");
    }
}
