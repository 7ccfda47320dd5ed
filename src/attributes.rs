//! TXT attribute maps
//!
//! Every answer from the tunnel server is a TXT record whose character
//! strings are `key=value` pairs:
//!
//! ```text
//! "success=True" "transmission_id=4f2a9c" "contents=aGVsbG8..." "contents=...rest"
//! ```
//!
//! A character string holds at most 255 octets, so long values are carried
//! as several strings with the same key, which are concatenated in order.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{QueryError, TransmitError};

/// Attribute reporting whether the server accepted the query
pub const SUCCESS: &str = "success";
/// Human readable failure reason, present when `success=False`
pub const ERROR: &str = "error";
/// Session token returned by the begin query
pub const TRANSMISSION_ID: &str = "transmission_id";
/// Base64 response payload returned by the end query
pub const CONTENTS: &str = "contents";

/// Maximum length of a single TXT character string
const MAX_CHARACTER_STRING: usize = 255;

/// Key/value attributes parsed from a TXT answer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    entries: BTreeMap<String, String>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, or append to its value when it is already present
    pub fn append(&mut self, key: impl Into<String>, value: &str) {
        self.entries.entry(key.into()).or_default().push_str(value);
    }

    /// Set `key`, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of a mandatory attribute
    pub fn require(&self, key: &str) -> Result<&str, TransmitError> {
        self.get(key).ok_or_else(|| TransmitError::missing(key))
    }

    /// Check the `success` attribute.
    ///
    /// `True` passes, `False` turns into [`TransmitError::ServerErrorResponse`]
    /// carrying the `error` attribute, anything else (including a missing
    /// key) is an [`TransmitError::UnexpectedServerResponse`].
    pub fn check_success(&self) -> Result<(), TransmitError> {
        match self.require(SUCCESS)? {
            "True" => Ok(()),
            "False" => Err(TransmitError::ServerErrorResponse {
                reason: self.get(ERROR).map(str::to_string),
            }),
            other => Err(TransmitError::unexpected(SUCCESS, other)),
        }
    }

    /// Encode as TXT RDATA, splitting long values over several strings
    pub fn to_txt_rdata(&self) -> Result<Vec<u8>, QueryError> {
        let mut buf = BytesMut::new();

        for (key, value) in &self.entries {
            let room = MAX_CHARACTER_STRING.saturating_sub(key.len() + 1);
            if room == 0 {
                return Err(QueryError::Malformed(format!("Attribute key too long: {}", key)));
            }

            let value = value.as_bytes();
            let mut parts = value.chunks(room).peekable();
            if parts.peek().is_none() {
                write_pair(&mut buf, key, &[]);
            }
            for part in parts {
                write_pair(&mut buf, key, part);
            }
        }

        Ok(buf.to_vec())
    }
}

fn write_pair(buf: &mut BytesMut, key: &str, value: &[u8]) {
    buf.put_u8((key.len() + 1 + value.len()) as u8);
    buf.put_slice(key.as_bytes());
    buf.put_u8(b'=');
    buf.put_slice(value);
}

impl<K, V> FromIterator<(K, V)> for AttributeMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = AttributeMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

/// Parse TXT RDATA (a run of length-prefixed character strings) into
/// attributes.
///
/// # Errors
///
/// Fails when a length prefix overruns the data, a string is not UTF-8, or a
/// string is not of the form `key=value` with a non-empty key.
pub fn parse_txt_attributes(rdata: &[u8]) -> Result<AttributeMap, QueryError> {
    let mut buf = rdata;
    let mut map = AttributeMap::new();

    while buf.has_remaining() {
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(QueryError::Malformed(format!(
                "TXT string claims {} bytes but only {} remain",
                len,
                buf.remaining()
            )));
        }

        let text = std::str::from_utf8(&buf[..len])
            .map_err(|e| QueryError::Malformed(format!("Invalid UTF-8 in TXT string: {}", e)))?;

        match text.split_once('=') {
            Some((key, value)) if !key.is_empty() => map.append(key, value),
            _ => {
                return Err(QueryError::Malformed(format!(
                    "TXT string is not key=value: {:?}",
                    text
                )))
            }
        }

        buf.advance(len);
    }

    Ok(map)
}
