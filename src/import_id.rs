//! Composite identifiers used to adopt resources created elsewhere.
//!
//! The backend's own id does not say where secrets should be written, so the
//! import id carries that alongside it, colon separated.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

const API_KEY_FORMAT: &str = "id:api_key_destination:on_behalf_of";
const SUBUSER_FORMAT: &str = "id:password_destination:password_length";

fn split(id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = id.splitn(3, ':');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

/// `id:destination:on_behalf_of`, where the last part may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyImport {
    pub id: String,
    pub destination: PathBuf,
    pub on_behalf_of: Option<String>,
}

impl FromStr for ApiKeyImport {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            Error::Validation(format!(
                "unexpected format of ID ({}), expected {}",
                id, API_KEY_FORMAT
            ))
        };

        let (key_id, destination, on_behalf_of) = split(id).ok_or_else(malformed)?;
        if key_id.is_empty() || destination.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            id: key_id.to_string(),
            destination: PathBuf::from(destination),
            on_behalf_of: (!on_behalf_of.is_empty()).then(|| on_behalf_of.to_string()),
        })
    }
}

/// `username:password_destination:password_length`, all parts required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubuserImport {
    pub username: String,
    pub password_destination: PathBuf,
    pub password_length: usize,
}

impl FromStr for SubuserImport {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            Error::Validation(format!(
                "unexpected format of ID ({}), expected {}",
                id, SUBUSER_FORMAT
            ))
        };

        let (username, destination, length) = split(id).ok_or_else(malformed)?;
        if username.is_empty() || destination.is_empty() || length.is_empty() {
            return Err(malformed());
        }

        let password_length = length
            .parse()
            .map_err(|_| Error::Validation(format!("invalid password length: {}", length)))?;

        Ok(Self {
            username: username.to_string(),
            password_destination: PathBuf::from(destination),
            password_length,
        })
    }
}
