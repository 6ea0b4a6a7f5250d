//! Participant profile domain model.

use crate::error::Result;
use crate::store::{Document, WriteData};
use serde::Deserialize;

/// Field names of the stored profile schema.
pub mod fields {
    pub const EMAIL: &str = "email";
    pub const DISPLAY_NAME: &str = "displayName";
}

/// Read-only view of a user's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileDocument {
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: String,
}

impl ParticipantProfile {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let raw: ProfileDocument = doc.decode()?;
        Ok(Self {
            id: doc.id().to_string(),
            email: raw.email,
            display_name: raw.display_name,
        })
    }

    pub fn to_document(&self) -> WriteData {
        WriteData::new()
            .set(fields::EMAIL, self.email.clone())
            .set(fields::DISPLAY_NAME, self.display_name.clone())
    }
}
