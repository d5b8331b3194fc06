use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_int;

use anyhow::{anyhow, Result};
use errno::errno;

use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

/// Opens a software CPU-clock perf event on one CPU, scoped to the tasks of
/// a cgroup, firing `sample_freq` times per second. The event is created
/// disabled; attaching the sampler program enables it.
pub fn setup_cgroup_perf_event(cgroup_fd: RawFd, cpu: i32, sample_freq: u64) -> Result<OwnedFd> {
    let mut attrs: perf_event_attr = perf_event_attr {
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_: sys::bindings::PERF_TYPE_SOFTWARE,
        config: sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64,
        ..Default::default()
    };
    attrs.__bindgen_anon_1.sample_freq = sample_freq;
    attrs.set_freq(1);
    attrs.set_disabled(1);

    let fd = unsafe {
        sys::perf_event_open(
            &mut attrs,
            cgroup_fd, // With PERF_FLAG_PID_CGROUP the pid argument carries the cgroup fd.
            cpu,
            -1, // group_fd
            u64::from(sys::bindings::PERF_FLAG_PID_CGROUP),
        )
    } as c_int;

    if fd < 0 {
        return Err(anyhow!(
            "perf_event_open for cgroup on cpu {} failed with errno {}",
            cpu,
            errno()
        ));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
