//! Utility functions and helpers
//!
//! Response time bookkeeping for transactions, formatting of per-connection
//! reports, and the test logger.

use std::time::Duration;

/// Round trip times of the transactions of one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseTimeMetrics {
    pub completed: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl ResponseTimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answered transaction
    pub fn record_success(&mut self, duration: Duration) {
        self.completed += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.completed as u32;
    }

    /// Record an exception answer or an expired transaction
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total() as f64) * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;
    use crate::manager::ConnectionCounters;
    use crate::transport::TransportStats;

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format the counters of one connection as a table
    pub fn format_connection_report(
        endpoint: &str,
        counters: &ConnectionCounters,
        metrics: &ResponseTimeMetrics,
        stats: &TransportStats,
    ) -> String {
        format!(
            "Connection {}:\n\
             ├─ Read requests: {}\n\
             ├─ Write requests: {}\n\
             ├─ Reconnections: {}\n\
             ├─ Answered: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average response: {}\n\
             ├─ Max response: {}\n\
             └─ Bytes sent/received: {}/{}",
            endpoint,
            counters.read_requests,
            counters.write_requests,
            counters.reconnections,
            metrics.completed,
            metrics.success_rate(),
            metrics.failed,
            format_duration(metrics.avg_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
            stats.bytes_sent,
            stats.bytes_received
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_time_metrics() {
        let mut metrics = ResponseTimeMetrics::new();

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure();

        assert_eq!(metrics.total(), 3);
        assert_eq!(metrics.avg_duration, Duration::from_millis(150));
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::registers_to_hex(&[0x1234, 0x5678]), "1234 5678");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(20)), "20ms");
    }
}
