//! Per-connection tuning knobs.

use std::time::Duration;

use crate::connection::RtpError;
use crate::packet::{MAX_PAYLOAD_LENGTH, MAX_WIRE_PAYLOAD};

/// Default number of retransmissions allowed for one packet.
pub const DEFAULT_MAX_RETRIES: u32 = 32;

/// Adjustable protocol parameters for one connection.
///
/// Both ends of a connection may use different values: the receiver accepts
/// any payload size the wire format can describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpConfig {
    /// Largest payload placed in a single packet by the packetizer.
    pub max_payload: usize,
    /// How many times one packet may be retransmitted after NACKs before the
    /// connection is declared dead.  `None` retries forever.
    pub max_retries: Option<u32>,
    /// Upper bound on how long the send worker waits for an ACK/NACK.
    /// `None` waits until an outcome arrives or the connection closes.
    pub ack_timeout: Option<Duration>,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_LENGTH,
            max_retries: Some(DEFAULT_MAX_RETRIES),
            ack_timeout: None,
        }
    }
}

impl RtpConfig {
    /// Reject values the packetizer or the wire format cannot honour.
    pub fn validate(&self) -> Result<(), RtpError> {
        if self.max_payload == 0 {
            return Err(RtpError::InvalidConfig("max_payload must be non-zero".into()));
        }
        if self.max_payload > MAX_WIRE_PAYLOAD {
            return Err(RtpError::InvalidConfig(format!(
                "max_payload {} exceeds wire limit {}",
                self.max_payload, MAX_WIRE_PAYLOAD
            )));
        }
        if self.ack_timeout == Some(Duration::ZERO) {
            return Err(RtpError::InvalidConfig("ack_timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Option<Duration>) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = RtpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload, MAX_PAYLOAD_LENGTH);
        assert_eq!(config.max_retries, Some(DEFAULT_MAX_RETRIES));
        assert_eq!(config.ack_timeout, None);
    }

    #[test]
    fn zero_payload_is_rejected() {
        let config = RtpConfig::default().with_max_payload(0);
        assert!(matches!(config.validate(), Err(RtpError::InvalidConfig(_))));
    }

    #[test]
    fn payload_beyond_wire_limit_is_rejected() {
        let config = RtpConfig::default().with_max_payload(MAX_WIRE_PAYLOAD + 1);
        assert!(matches!(config.validate(), Err(RtpError::InvalidConfig(_))));
    }

    #[test]
    fn zero_ack_timeout_is_rejected() {
        let config = RtpConfig::default().with_ack_timeout(Some(Duration::ZERO));
        assert!(matches!(config.validate(), Err(RtpError::InvalidConfig(_))));
    }
}
