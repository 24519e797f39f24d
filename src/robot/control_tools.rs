// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Helpers for running the control loop thread.
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::exception::ArmException;
use crate::ArmResult;

/// Determines whether the current OS kernel is a realtime kernel.
///
/// On Linux, this checks for the existence of `/sys/kernel/realtime`.
pub fn has_realtime_kernel() -> bool {
    Path::new("/sys/kernel/realtime").exists()
}

/// Sets the current thread to the highest possible scheduler priority.
///
/// # Errors
/// * RealtimeException if realtime priority cannot be set for the current thread.
///
/// If the method returns an Error please check your /etc/security/limits.conf file
/// There should be a line like this:
/// ```text
///robot            -       rtprio          99
/// ```
pub fn set_current_thread_to_highest_scheduler_priority() -> ArmResult<()> {
    unsafe {
        let max_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max_priority == -1 {
            return Err(ArmException::RealTimeException {
                message: "unable to get maximum possible thread priority".to_string(),
            });
        }
        let thread_param = libc::sched_param {
            // one below the maximum, leaving the top priority to the kernel's own threads
            sched_priority: max_priority - 1,
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &thread_param) != 0 {
            return Err(ArmException::RealTimeException {
                message: "unable to set realtime scheduling".to_string(),
            });
        }
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            return Err(ArmException::RealTimeException {
                message: "unable to lock memory".to_string(),
            });
        }
    }
    Ok(())
}

/// Sleeps until `deadline`. Returns immediately if it already passed.
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

/// Converts a rate in \[Hz\] into a period.
pub fn period_from_rate(rate: f64) -> Duration {
    Duration::from_secs_f64(1. / rate)
}
