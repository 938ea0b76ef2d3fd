//! Utility functions shared across modules

/// Time conversion utilities
pub mod time {
    use std::time::Duration;

    /// Convert Duration to milliseconds as f64
    pub fn duration_to_ms_f64(duration: Duration) -> f64 {
        duration.as_secs_f64() * 1000.0
    }

    /// Format a wait bound the way the console shows it, e.g. `1s` or `2.5s`
    pub fn format_seconds(duration: Duration) -> String {
        let secs = duration.as_secs_f64();
        if secs.fract() == 0.0 {
            format!("{}s", secs as u64)
        } else {
            format!("{:.1}s", secs)
        }
    }
}

/// Mathematical utilities
pub mod math {
    /// Arithmetic mean, or `None` for an empty slice
    pub fn mean(values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Network address utilities
pub mod network {
    use std::net::IpAddr;

    /// Format IP address as string, or "???" if None
    pub fn format_optional_ip(addr: Option<IpAddr>) -> String {
        addr.map(|a| a.to_string())
            .unwrap_or_else(|| "???".to_string())
    }

    /// Format hostname with fallback to IP address
    pub fn format_hostname_with_fallback(
        hostname: Option<String>,
        addr: Option<IpAddr>,
    ) -> String {
        hostname.unwrap_or_else(|| format_optional_ip(addr))
    }
}
