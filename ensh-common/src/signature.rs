// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Ed25519 verification of inbound interactions.
//!
//! Discord signs `timestamp || body` with the application key. The body is
//! only handed out for parsing after the signature checks out, so nothing
//! downstream can see an unverified payload.

use std::ops::Deref;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use thiserror::Error;

use crate::{Interaction, InteractionKind};

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("public key is invalid: {0}")]
    PublicKey(String),
    #[error("signature is not valid hex")]
    Encoding,
    #[error("signature has {0} bytes, expected 64")]
    Length(usize),
    #[error("signature does not match")]
    Mismatch,
}

pub fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| SignatureError::PublicKey(format!("not hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::PublicKey(format!("{} bytes, expected 32", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::PublicKey(e.to_string()))
}

/// A request body whose signature has been checked.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedBody<'a> {
    body: &'a str,
}

/// Only the `type` field; everything else in the body is ignored.
#[derive(Deserialize)]
struct InteractionHeader {
    #[serde(rename = "type")]
    kind: u8,
}

impl<'a> VerifiedBody<'a> {
    /// Reads the interaction type without requiring the rest of the body to
    /// have the full interaction shape.
    pub fn kind(&self) -> serde_json::Result<InteractionKind> {
        serde_json::from_str::<InteractionHeader>(self.body)
            .map(|header| InteractionKind::from_code(header.kind))
    }

    pub fn parse(&self) -> serde_json::Result<VerifiedInteraction> {
        serde_json::from_str(self.body).map(VerifiedInteraction)
    }
}

/// An interaction parsed from a [`VerifiedBody`].
#[derive(Debug, Clone)]
pub struct VerifiedInteraction(Interaction);

impl VerifiedInteraction {
    pub fn interaction(&self) -> &Interaction {
        &self.0
    }
}

impl Deref for VerifiedInteraction {
    type Target = Interaction;

    fn deref(&self) -> &Interaction {
        &self.0
    }
}

pub fn verify<'a>(
    key: &VerifyingKey,
    signature_hex: &str,
    timestamp: &str,
    body: &'a str,
) -> Result<VerifiedBody<'a>, SignatureError> {
    let bytes = hex::decode(signature_hex.trim()).map_err(|_| SignatureError::Encoding)?;
    let bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::Length(bytes.len()))?;
    let signature = Signature::from_bytes(&bytes);

    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body.as_bytes());

    key.verify_strict(&message, &signature)
        .map_err(|_| SignatureError::Mismatch)?;
    Ok(VerifiedBody { body })
}
