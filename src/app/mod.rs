//! Application Layer
//!
//! The two ends of the tunnel:
//! - TunnelClient: local TCP listener, one mux stream per connection
//! - TunnelServer: one mux session per tunnel connection, SOCKS5 per stream

mod client;
mod server;

pub use client::TunnelClient;
pub use server::TunnelServer;

/// Human readable byte count for connection logs
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}
