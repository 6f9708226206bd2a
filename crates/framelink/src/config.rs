//! Configuration for a Framelink link (client or per-connection server side).

use std::time::Duration;

/// Tunables for delivery deadlines, resumption, and reconnect pacing.
///
/// Durations set to [`Duration::ZERO`] disable the corresponding timer.
/// Sensible defaults are provided; override just the fields you care about:
///
/// ```rust
/// use std::time::Duration;
/// use framelink::LinkConfig;
///
/// let config = LinkConfig {
///     ack_timeout: Duration::from_secs(5),
///     ..LinkConfig::default()
/// };
/// # assert!(config.resumption_enabled);
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Deadline for the remote's acknowledgement of each reliable message.
    /// Firing surfaces an error to observers; the message stays queued and
    /// may still be acknowledged on a resumed session.
    ///
    /// Default: 15 seconds.
    pub ack_timeout: Duration,

    /// Default deadline for a request's response. Firing rejects the
    /// request's completion. Individual requests can override it.
    ///
    /// Default: zero (requests wait indefinitely).
    pub default_operation_timeout: Duration,

    /// Reserved for the heartbeat mechanism. Accepted but not yet acted on.
    ///
    /// Default: 15 seconds.
    pub heartbeat_timeout: Duration,

    /// Whether queued messages are retained across an unintentional
    /// disconnect and flushed when the session resumes. When disabled,
    /// any disconnect drops the queue.
    ///
    /// Default: `true`.
    pub resumption_enabled: bool,

    /// Reserved: how long resumable state may be retained. Accepted but not
    /// yet acted on — retained messages currently live until an intentional
    /// disconnect or the client is dropped.
    ///
    /// Default: 15 minutes.
    pub resumption_timeout: Duration,

    /// Delay between connection attempts while a client is in persistent
    /// mode.
    ///
    /// Default: 1 second.
    pub reconnect_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            default_operation_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::from_secs(15),
            resumption_enabled: true,
            resumption_timeout: Duration::from_secs(900),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = LinkConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(15));
        assert_eq!(config.default_operation_timeout, Duration::ZERO);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert!(config.resumption_enabled);
        assert_eq!(config.resumption_timeout, Duration::from_secs(900));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }
}
