use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Filter directive used when RUST_LOG is unset
pub fn default_directive(level: LogLevel) -> String {
    format!("veilgate={}", level.as_str())
}

pub fn init_logger(log_level: Option<LogLevel>) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(default_directive(log_level.unwrap_or_default()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// Connection lifecycle event
    pub fn connection(addr: &str, event: &str) {
        debug!(peer = addr, event = event, "Connection");
    }

    /// Trojan password check outcome
    pub fn authentication(addr: &str, success: bool) {
        if success {
            debug!(peer = addr, "Authentication successful");
        } else {
            warn!(peer = addr, "Authentication failed");
        }
    }

    /// Handshake / framing event
    pub fn protocol(event: &str, error: Option<&str>) {
        if let Some(err) = error {
            warn!(event = event, error = err, "Protocol");
        } else {
            debug!(event = event, "Protocol");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(LogLevel::Warn), "veilgate=warn");
    }
}
