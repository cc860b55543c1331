//! Environment-driven configuration for the gateway broker

use std::time::Duration;

/// Tunables for gateway connections and terminal sessions.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long the dispatcher loop waits for a frame before probing.
    pub idle_timeout: Duration,
    /// How long a terminal setup request may wait for the gateway's reply.
    pub terminal_start_timeout: Duration,
    /// Maximum queued tasks pushed on connect.
    pub pending_task_batch: usize,
    /// Whether a plain ping refreshes `last_heartbeat_at` like a heartbeat.
    pub ping_refreshes_heartbeat: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            terminal_start_timeout: Duration::from_secs(10),
            pending_task_batch: 10,
            ping_refreshes_heartbeat: true,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_timeout: env_secs("GATEWAY_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            terminal_start_timeout: env_secs(
                "TERMINAL_START_TIMEOUT_SECS",
                defaults.terminal_start_timeout,
            ),
            pending_task_batch: defaults.pending_task_batch,
            ping_refreshes_heartbeat: env_flag(
                "GATEWAY_PING_REFRESHES_HEARTBEAT",
                defaults.ping_refreshes_heartbeat,
            ),
        }
    }
}

pub fn bind_addr() -> String {
    std::env::var("OPS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw, default),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => parse_secs(&raw, default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_secs(raw: &str, default: Duration) -> Duration {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        assert!(parse_flag("yes", false));
        assert!(parse_flag(" On ", false));
        assert!(!parse_flag("0", true));
        assert!(parse_flag("garbage", true));
    }

    #[test]
    fn parses_seconds_with_fallback() {
        assert_eq!(parse_secs("30", Duration::from_secs(90)), Duration::from_secs(30));
        assert_eq!(parse_secs("0", Duration::from_secs(90)), Duration::from_secs(90));
        assert_eq!(parse_secs("abc", Duration::from_secs(90)), Duration::from_secs(90));
    }
}
