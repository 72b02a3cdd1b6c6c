//! Command reports, queued commands and bootstrap token responses.

use plist::Data;
use serde::{Deserialize, Serialize};

use crate::EncodeError;

/// A device reporting the result of a command, or reporting `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandResults {
    #[serde(rename = "UDID")]
    pub udid: Option<String>,
    #[serde(rename = "UserID")]
    pub user_id: Option<String>,
    #[serde(rename = "EnrollmentID")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "EnrollmentUserID")]
    pub enrollment_user_id: Option<String>,
    /// Absent when the device reports `Idle`.
    #[serde(rename = "CommandUUID")]
    pub command_uuid: Option<String>,
    /// `Acknowledged`, `Error`, `CommandFormatError`, `Idle` or `NotNow`.
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ErrorChain", default)]
    pub error_chain: Vec<ErrorChainItem>,
    /// The undecoded report body.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorChainItem {
    #[serde(rename = "ErrorCode")]
    pub error_code: Option<i64>,
    #[serde(rename = "ErrorDomain")]
    pub error_domain: Option<String>,
    #[serde(rename = "LocalizedDescription")]
    pub localized_description: Option<String>,
    #[serde(rename = "USEnglishDescription")]
    pub us_english_description: Option<String>,
}

/// The next command to hand to a device, already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_uuid: String,
    pub request_type: String,
    /// Encoded property list sent verbatim as the response body.
    pub raw: Vec<u8>,
}

/// Response to `GetBootstrapToken`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapToken {
    #[serde(rename = "BootstrapToken")]
    pub bootstrap_token: Data,
}

impl BootstrapToken {
    pub fn new(token: Vec<u8>) -> Self {
        Self {
            bootstrap_token: Data::new(token),
        }
    }

    /// Encodes the token as an XML property list.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the plist writer fails.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, self)?;
        Ok(buf)
    }
}
