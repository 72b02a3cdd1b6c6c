//! Check-in messages.

use plist::Data;
use serde::Deserialize;

/// The closed set of check-in messages the server dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinMessage {
    Authenticate(Authenticate),
    TokenUpdate(TokenUpdate),
    CheckOut(CheckOut),
    UserAuthenticate(UserAuthenticate),
    SetBootstrapToken(SetBootstrapToken),
    GetBootstrapToken(GetBootstrapToken),
}

impl CheckinMessage {
    /// The `MessageType` value this message was decoded from.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "Authenticate",
            Self::TokenUpdate(_) => "TokenUpdate",
            Self::CheckOut(_) => "CheckOut",
            Self::UserAuthenticate(_) => "UserAuthenticate",
            Self::SetBootstrapToken(_) => "SetBootstrapToken",
            Self::GetBootstrapToken(_) => "GetBootstrapToken",
        }
    }

    /// Device UDID, when the message carries one.
    pub fn udid(&self) -> Option<&str> {
        match self {
            Self::Authenticate(m) => m.udid.as_deref(),
            Self::TokenUpdate(m) => m.udid.as_deref(),
            Self::CheckOut(m) => m.udid.as_deref(),
            Self::UserAuthenticate(m) => m.udid.as_deref(),
            Self::SetBootstrapToken(m) => m.udid.as_deref(),
            Self::GetBootstrapToken(m) => m.udid.as_deref(),
        }
    }
}

/// First message of an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Authenticate {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "Topic", default)]
    pub topic: String,
    #[serde(rename = "BuildVersion")]
    pub build_version: Option<String>,
    #[serde(rename = "DeviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "Model")]
    pub model: Option<String>,
    #[serde(rename = "ModelName")]
    pub model_name: Option<String>,
    #[serde(rename = "OSVersion")]
    pub os_version: Option<String>,
    #[serde(rename = "ProductName")]
    pub product_name: Option<String>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: Option<String>,
    #[serde(rename = "IMEI")]
    pub imei: Option<String>,
    #[serde(rename = "MEID")]
    pub meid: Option<String>,
}

/// Push token registration for a device or user channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenUpdate {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "UserID")]
    pub user_id: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "EnrollmentUserID")]
    pub enrollment_user_id: Option<String>,
    #[serde(rename = "UserShortName")]
    pub user_short_name: Option<String>,
    #[serde(rename = "UserLongName")]
    pub user_long_name: Option<String>,
    #[serde(rename = "Topic", default)]
    pub topic: String,
    #[serde(rename = "PushMagic", default)]
    pub push_magic: String,
    #[serde(rename = "Token")]
    pub token: Option<Data>,
    #[serde(rename = "UnlockToken")]
    pub unlock_token: Option<Data>,
    #[serde(rename = "AwaitingConfiguration")]
    pub awaiting_configuration: Option<bool>,
}

/// The device is leaving management.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckOut {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "UserID")]
    pub user_id: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "Topic")]
    pub topic: Option<String>,
}

/// A user channel asking to be authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserAuthenticate {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "UserID", default)]
    pub user_id: String,
    #[serde(rename = "UserShortName")]
    pub user_short_name: Option<String>,
    #[serde(rename = "UserLongName")]
    pub user_long_name: Option<String>,
    /// Present on the second round of the digest challenge.
    #[serde(rename = "DigestResponse")]
    pub digest_response: Option<String>,
}

/// Escrow of a bootstrap token; an absent token clears the escrow.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetBootstrapToken {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "BootstrapToken")]
    pub bootstrap_token: Option<Data>,
    #[serde(rename = "AwaitingConfiguration")]
    pub awaiting_configuration: Option<bool>,
}

/// Request for the escrowed bootstrap token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GetBootstrapToken {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "AwaitingConfiguration")]
    pub awaiting_configuration: Option<bool>,
}
