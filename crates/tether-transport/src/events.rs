//! Mapping from inbound frames to transport events.

use tether_protocol::{Action, ErrorInfo, ProtocolMessage};

use crate::traits::TransportEvent;

/// Classify one inbound frame.
///
/// Returns `None` for frames that carry nothing beyond liveness.
#[must_use]
pub fn classify(frame: ProtocolMessage) -> Option<TransportEvent> {
    let event = match frame.action {
        Action::Heartbeat => TransportEvent::Heartbeat { id: frame.id },
        Action::Ack => TransportEvent::Ack {
            serial: frame.msg_serial.unwrap_or(0),
            count: frame.count.unwrap_or(1),
        },
        Action::Nack => TransportEvent::Nack {
            serial: frame.msg_serial.unwrap_or(0),
            count: frame.count.unwrap_or(1),
            error: frame.error.unwrap_or_else(ErrorInfo::nack_default),
        },
        Action::Connected => TransportEvent::Connected {
            connection_id: frame.connection_id.unwrap_or_default(),
            details: frame.connection_details.unwrap_or_default(),
            error: frame.error,
            msg_serial: frame.msg_serial,
            connection_serial: frame.connection_serial,
        },
        Action::Disconnected => {
            TransportEvent::Disconnected(frame.error.unwrap_or_else(ErrorInfo::disconnected))
        }
        Action::Closed => TransportEvent::Closed,
        Action::Error if frame.is_connection_level() => {
            let error = frame.error.unwrap_or_else(ErrorInfo::failed);
            if error.is_token_error() {
                TransportEvent::Disconnected(error)
            } else {
                TransportEvent::Failed(error)
            }
        }
        Action::Auth => TransportEvent::AuthRequested,
        Action::Connect | Action::Disconnect | Action::Close => return None,
        _ => TransportEvent::Channel(frame),
    };
    Some(event)
}

/// Frame synthesized from an HTTP error response.
///
/// [Fatal](ErrorInfo::is_fatal) errors become ERROR frames, everything else
/// a DISCONNECTED frame.
#[must_use]
pub fn frame_from_http_error(error: ErrorInfo) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(if error.is_fatal() {
        Action::Error
    } else {
        Action::Disconnected
    });
    frame.error = Some(error);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::ConnectionDetails;

    #[test]
    fn test_connection_error_fails() {
        let event = classify(ProtocolMessage::error(ErrorInfo::new(40100, 401, "bad key")));
        assert!(matches!(event, Some(TransportEvent::Failed(e)) if e.code == 40100));
    }

    #[test]
    fn test_token_error_disconnects() {
        let event = classify(ProtocolMessage::error(ErrorInfo::new(40142, 401, "expired")));
        assert!(matches!(event, Some(TransportEvent::Disconnected(e)) if e.code == 40142));
    }

    #[test]
    fn test_channel_error_is_routed() {
        let mut frame = ProtocolMessage::error(ErrorInfo::new(40160, 401, "denied"));
        frame.channel = Some("private".into());
        assert!(matches!(classify(frame), Some(TransportEvent::Channel(_))));
    }

    #[test]
    fn test_nack_default_error() {
        let event = classify(ProtocolMessage::nack(3, 2, None)).unwrap();
        assert_eq!(
            event,
            TransportEvent::Nack {
                serial: 3,
                count: 2,
                error: ErrorInfo::nack_default()
            }
        );
    }

    #[test]
    fn test_connected() {
        let mut frame = ProtocolMessage::connected("c1", ConnectionDetails::default());
        frame.msg_serial = Some(5);
        match classify(frame) {
            Some(TransportEvent::Connected {
                connection_id,
                msg_serial,
                ..
            }) => {
                assert_eq!(connection_id, "c1");
                assert_eq!(msg_serial, Some(5));
            }
            other => panic!("Expected Connected, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_request() {
        let event = classify(ProtocolMessage::new(Action::Auth));
        assert_eq!(event, Some(TransportEvent::AuthRequested));
    }

    #[test]
    fn test_http_error_frames() {
        assert_eq!(
            frame_from_http_error(ErrorInfo::new(40100, 401, "bad")).action,
            Action::Error
        );
        assert_eq!(
            frame_from_http_error(ErrorInfo::new(40142, 401, "expired")).action,
            Action::Disconnected
        );
        assert_eq!(
            frame_from_http_error(ErrorInfo::new(50000, 500, "internal")).action,
            Action::Disconnected
        );
    }
}
