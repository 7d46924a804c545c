// src/stopwatch.rs - Pausable elapsed time measurement
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started() -> Self {
        let mut stopwatch = Self::new();
        stopwatch.start();
        stopwatch
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    pub fn stop_at(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        let running = self.running_since.map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        self.accumulated + running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pausing_excludes_stopped_time() {
        let t0 = Instant::now();
        let mut watch = Stopwatch::new();
        watch.start_at(t0);
        watch.stop_at(t0 + Duration::from_secs(5));
        assert_eq!(watch.elapsed_at(t0 + Duration::from_secs(60)), Duration::from_secs(5));

        watch.start_at(t0 + Duration::from_secs(10));
        assert!(watch.is_running());
        assert_eq!(watch.elapsed_at(t0 + Duration::from_secs(12)), Duration::from_secs(7));

        watch.reset();
        assert_eq!(watch.elapsed_at(t0 + Duration::from_secs(20)), Duration::ZERO);
        assert!(!watch.is_running());
    }

    #[test]
    fn test_double_start_keeps_first_instant() {
        let t0 = Instant::now();
        let mut watch = Stopwatch::new();
        watch.start_at(t0);
        watch.start_at(t0 + Duration::from_secs(3));
        assert_eq!(watch.elapsed_at(t0 + Duration::from_secs(4)), Duration::from_secs(4));
    }
}
