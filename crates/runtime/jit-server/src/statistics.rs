//! Periodic statistics logging for the compilation server

use crate::metrics::MetricsSource;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug)]
pub struct StatisticsThread {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl StatisticsThread {
    pub fn start(interval: Duration, source: Arc<dyn MetricsSource>) -> io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let thread = {
            let signal = Arc::clone(&signal);
            std::thread::Builder::new()
                .name("jit-statistics".to_string())
                .spawn(move || {
                    let mut stop = signal.stop.lock();
                    while !*stop {
                        if signal.wake.wait_for(&mut stop, interval).timed_out() {
                            for metric in source.collect() {
                                info!(target: "jit::perf", name = metric.name, value = metric.value, "server statistics");
                            }
                        }
                    }
                })?
        };
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatisticsThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_collects_periodically_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source: Arc<dyn MetricsSource> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![Metric::new("x", "x", 1u32)]
        });
        let mut thread = StatisticsThread::start(Duration::from_millis(5), source).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        thread.stop();
        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
