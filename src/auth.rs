//! Shared-token authentication for the control connection.
//!
//! The tunnel client proves itself with a single `auth` message carrying the
//! token from `tunnel.token`. The comparison never short-circuits.

use crate::tunnel::frame::ControlMessage;

/// Whether `msg` is an `auth` message carrying `expected`.
///
/// Any other message type fails, so callers can pass the first message of a
/// connection straight through.
pub fn is_valid_auth(expected: &str, msg: &ControlMessage) -> bool {
    match msg {
        ControlMessage::Auth { token } => constant_time_eq(expected.as_bytes(), token.as_bytes()),
        _ => false,
    }
}

/// Constant-time byte comparison.
///
/// Walks the full length of `expected` whatever the length of `provided`, so
/// response timing reveals neither the matching prefix nor the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_auth_message() {
        let good = ControlMessage::Auth {
            token: "tok".into(),
        };
        let bad = ControlMessage::Auth {
            token: "nope".into(),
        };
        assert!(is_valid_auth("tok", &good));
        assert!(!is_valid_auth("tok", &bad));
    }

    #[test]
    fn test_non_auth_message_fails() {
        let msg = ControlMessage::End { id: "tok".into() };
        assert!(!is_valid_auth("tok", &msg));
    }
}
