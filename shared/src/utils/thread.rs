//! Thread identification

/// Kernel thread id of the calling thread, for log correlation.
#[cfg(target_os = "linux")]
pub fn os_thread_id() -> i64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) }
}

/// Stable per-thread number derived from the std thread id.
#[cfg(not(target_os = "linux"))]
pub fn os_thread_id() -> i64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() >> 1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_differ_across_threads() {
        let here = os_thread_id();
        let there = std::thread::spawn(os_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
