use core::sync::atomic::{fence, Ordering};

/// Forces every other thread's pending writes to become visible before this
/// call returns, without requiring those threads to execute barriers on their
/// hot paths. The write-watch scan uses this to observe barrier-free dirty
/// marking.
#[cfg(target_os = "linux")]
pub fn flush_process_write_buffers() {
    // MEMBARRIER_CMD_GLOBAL interrupts every running thread in the process.
    // Falls back to a fence on kernels without the syscall.
    const MEMBARRIER_CMD_GLOBAL: libc::c_int = 1;
    let rc = unsafe { libc::syscall(libc::SYS_membarrier, MEMBARRIER_CMD_GLOBAL, 0) };
    if rc != 0 {
        fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn flush_process_write_buffers() {
    fence(Ordering::SeqCst);
}
