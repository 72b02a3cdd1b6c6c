//! MDM protocol messages and their property-list wire format.
//!
//! Devices talk to the server with XML (or binary) property lists. Check-in
//! messages are told apart by their `MessageType` key; command reports are a
//! single message shape. This crate is the only place that knows about the
//! plist encoding.

mod checkin;
mod command;

pub use checkin::{
    Authenticate, CheckOut, CheckinMessage, GetBootstrapToken, SetBootstrapToken, TokenUpdate,
    UserAuthenticate,
};
pub use command::{BootstrapToken, Command, CommandResults, ErrorChainItem};

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while decoding a message body.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body is not a property list of the expected shape.
    #[error("parsing property list: {0}")]
    Plist(#[from] plist::Error),

    /// The body parsed but names a message type outside the supported set.
    #[error("unrecognized message type {0:?}")]
    UnrecognizedMessageType(String),
}

/// Errors produced while encoding a response body.
#[derive(Debug, Error)]
#[error("encoding property list: {0}")]
pub struct EncodeError(#[from] plist::Error);

#[derive(Deserialize)]
struct MessageTypeTag {
    #[serde(rename = "MessageType", default)]
    message_type: String,
}

/// Decodes a check-in body into one of the supported check-in messages.
///
/// # Errors
///
/// Returns [`DecodeError::Plist`] if the body is not a property list
/// dictionary or does not match its message's shape, and
/// [`DecodeError::UnrecognizedMessageType`] for a well-formed dictionary whose
/// `MessageType` is missing or unsupported.
pub fn decode_checkin(raw: &[u8]) -> Result<CheckinMessage, DecodeError> {
    let tag: MessageTypeTag = plist::from_bytes(raw)?;
    let message = match tag.message_type.as_str() {
        "Authenticate" => CheckinMessage::Authenticate(plist::from_bytes(raw)?),
        "TokenUpdate" => CheckinMessage::TokenUpdate(plist::from_bytes(raw)?),
        "CheckOut" => CheckinMessage::CheckOut(plist::from_bytes(raw)?),
        "UserAuthenticate" => CheckinMessage::UserAuthenticate(plist::from_bytes(raw)?),
        "SetBootstrapToken" => CheckinMessage::SetBootstrapToken(plist::from_bytes(raw)?),
        "GetBootstrapToken" => CheckinMessage::GetBootstrapToken(plist::from_bytes(raw)?),
        other => return Err(DecodeError::UnrecognizedMessageType(other.to_string())),
    };
    Ok(message)
}

/// Decodes a command report body, keeping the raw bytes on the result.
///
/// # Errors
///
/// Returns [`DecodeError::Plist`] if the body is not a valid report.
pub fn decode_command_results(raw: &[u8]) -> Result<CommandResults, DecodeError> {
    let mut report: CommandResults = plist::from_bytes(raw)?;
    report.raw = raw.to_vec();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plist_dict(entries: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
{entries}
</dict>
</plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_authenticate() {
        let body = plist_dict(
            "<key>MessageType</key><string>Authenticate</string>
             <key>UDID</key><string>0000-1111</string>
             <key>Topic</key><string>com.apple.mgmt.External.abc</string>
             <key>SerialNumber</key><string>C02XYZ</string>",
        );

        let CheckinMessage::Authenticate(msg) = decode_checkin(&body).unwrap() else {
            panic!("expected Authenticate");
        };
        assert_eq!(msg.udid.as_deref(), Some("0000-1111"));
        assert_eq!(msg.topic, "com.apple.mgmt.External.abc");
        assert_eq!(msg.serial_number.as_deref(), Some("C02XYZ"));
        assert_eq!(msg.device_name, None);
    }

    #[test]
    fn decodes_token_update_with_data_fields() {
        let body = plist_dict(
            "<key>MessageType</key><string>TokenUpdate</string>
             <key>UDID</key><string>0000-1111</string>
             <key>Topic</key><string>com.apple.mgmt.External.abc</string>
             <key>PushMagic</key><string>magic</string>
             <key>Token</key><data>AQID</data>
             <key>AwaitingConfiguration</key><true/>",
        );

        let message = decode_checkin(&body).unwrap();
        assert_eq!(message.message_type(), "TokenUpdate");
        let CheckinMessage::TokenUpdate(msg) = message else {
            panic!("expected TokenUpdate");
        };
        let token = msg.token.expect("token present");
        let token: &[u8] = token.as_ref();
        assert_eq!(token, [1, 2, 3]);
        assert_eq!(msg.awaiting_configuration, Some(true));
        assert!(msg.unlock_token.is_none());
    }

    #[test]
    fn decodes_every_supported_message_type() {
        let cases = [
            ("CheckOut", "<key>Topic</key><string>t</string>"),
            (
                "UserAuthenticate",
                "<key>UserID</key><string>user-1</string>",
            ),
            ("SetBootstrapToken", "<key>BootstrapToken</key><data>AAEC</data>"),
            ("GetBootstrapToken", ""),
        ];
        for (message_type, extra) in cases {
            let body = plist_dict(&format!(
                "<key>MessageType</key><string>{message_type}</string>
                 <key>UDID</key><string>0000-1111</string>{extra}"
            ));
            let message = decode_checkin(&body).unwrap();
            assert_eq!(message.message_type(), message_type);
            assert_eq!(message.udid(), Some("0000-1111"));
        }
    }

    #[test]
    fn unknown_message_type_is_distinct_from_parse_failure() {
        let unknown = plist_dict("<key>MessageType</key><string>DeclarativeManagement</string>");
        assert!(matches!(
            decode_checkin(&unknown),
            Err(DecodeError::UnrecognizedMessageType(t)) if t == "DeclarativeManagement"
        ));

        let missing = plist_dict("<key>Hello</key><string>world</string>");
        assert!(matches!(
            decode_checkin(&missing),
            Err(DecodeError::UnrecognizedMessageType(t)) if t.is_empty()
        ));

        assert!(matches!(
            decode_checkin(b"\x00\x01 not a plist"),
            Err(DecodeError::Plist(_))
        ));
    }

    #[test]
    fn recognized_type_with_wrong_shape_is_a_parse_failure() {
        let body = plist_dict(
            "<key>MessageType</key><string>Authenticate</string>
             <key>Topic</key><integer>7</integer>",
        );
        assert!(matches!(decode_checkin(&body), Err(DecodeError::Plist(_))));
    }

    #[test]
    fn missing_string_and_token_fields_decode_empty() {
        let authenticate = plist_dict(
            "<key>MessageType</key><string>Authenticate</string>
             <key>UDID</key><string>0000-1111</string>",
        );
        let CheckinMessage::Authenticate(msg) = decode_checkin(&authenticate).unwrap() else {
            panic!("expected Authenticate");
        };
        assert_eq!(msg.topic, "");

        let token_update = plist_dict(
            "<key>MessageType</key><string>TokenUpdate</string>
             <key>UDID</key><string>0000-1111</string>",
        );
        let CheckinMessage::TokenUpdate(msg) = decode_checkin(&token_update).unwrap() else {
            panic!("expected TokenUpdate");
        };
        assert_eq!(msg.topic, "");
        assert_eq!(msg.push_magic, "");
        assert!(msg.token.is_none());
    }

    #[test]
    fn decodes_command_results_and_keeps_raw_bytes() {
        let body = plist_dict(
            "<key>UDID</key><string>0000-1111</string>
             <key>CommandUUID</key><string>cmd-1</string>
             <key>Status</key><string>Error</string>
             <key>ErrorChain</key><array><dict>
                <key>ErrorCode</key><integer>12021</integer>
                <key>ErrorDomain</key><string>MCMDMErrorDomain</string>
             </dict></array>",
        );

        let report = decode_command_results(&body).unwrap();
        assert_eq!(report.status, "Error");
        assert_eq!(report.command_uuid.as_deref(), Some("cmd-1"));
        assert_eq!(report.error_chain[0].error_code, Some(12021));
        assert_eq!(report.raw, body);
    }

    #[test]
    fn command_results_without_status_fail() {
        let body = plist_dict("<key>UDID</key><string>0000-1111</string>");
        assert!(decode_command_results(&body).is_err());
    }
}
