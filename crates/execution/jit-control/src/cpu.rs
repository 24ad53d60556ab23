//! Process CPU utilization and host memory probes

use std::time::{Duration, Instant};

/// CPU time consumed by this process so far.
#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    // SAFETY: getrusage only writes into the zeroed struct we pass.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };
    let to_duration = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    Some(to_duration(usage.ru_utime) + to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

/// Available physical memory reported by the host, if known.
#[cfg(target_os = "linux")]
pub fn host_free_physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_AVPHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages < 0 || page_size <= 0 {
        return None;
    }
    Some(pages as u64 * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn host_free_physical_memory() -> Option<u64> {
    None
}

/// Tracks process CPU utilization between updates, as a percentage of one
/// CPU.
#[derive(Debug)]
pub struct CpuUtilization {
    last_wall: Instant,
    last_cpu: Option<Duration>,
    utilization: Option<u32>,
    min_interval: Duration,
}

impl CpuUtilization {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_wall: Instant::now(),
            last_cpu: process_cpu_time(),
            utilization: None,
            min_interval,
        }
    }

    /// Recompute utilization if at least the minimum interval has passed.
    pub fn update(&mut self) -> Option<u32> {
        let now = Instant::now();
        let wall = now.saturating_duration_since(self.last_wall);
        if wall < self.min_interval {
            return self.utilization;
        }
        let cpu = process_cpu_time();
        if let (Some(previous), Some(current)) = (self.last_cpu, cpu) {
            let used = current.saturating_sub(previous);
            let percent = used.as_secs_f64() / wall.as_secs_f64().max(f64::EPSILON) * 100.0;
            self.utilization = Some(percent.round() as u32);
        }
        self.last_wall = now;
        self.last_cpu = cpu;
        self.utilization
    }

    pub fn utilization(&self) -> Option<u32> {
        self.utilization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_respects_interval() {
        let mut cpu = CpuUtilization::new(Duration::from_secs(3600));
        assert_eq!(cpu.update(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_busy_loop_shows_utilization() {
        let mut cpu = CpuUtilization::new(Duration::from_millis(10));
        let start = Instant::now();
        let mut x = 0u64;
        while start.elapsed() < Duration::from_millis(50) {
            x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(7));
        }
        assert!(cpu.update().is_some());
    }
}
