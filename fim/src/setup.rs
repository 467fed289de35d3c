use anyhow::bail;
use log::debug;

pub fn check_permission() -> anyhow::Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("currently only supports running as the root user.");
    }
    Ok(())
}

/// Lifts the locked memory limit so older kernels can allocate the maps.
pub fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }
}
