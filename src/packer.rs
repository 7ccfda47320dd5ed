//! Domain packing
//!
//! Folds a payload into the smallest sequence of domain names that can carry
//! it. Every name starts from a parent produced for its sequence number and
//! is then filled greedily with payload labels until either the payload or
//! the 255-octet name budget runs out.
//!
//! ```text
//! payload:   0123456789abcdefghij...
//! parent(0): 0.<tid>.continue.tunnel.example.com
//! domain 0:  <63 chars>.<63 chars>.<n chars>.0.<tid>.continue.tunnel.example.com
//! ```
//!
//! Binary payloads are first encoded with DNS-safe base32 (RFC 4648
//! "base32hex", lowercase, unpadded), which only produces `[0-9a-v]`.

use std::iter::FusedIterator;

use data_encoding::BASE32_DNSSEC;
use thiserror::Error;

use crate::domain::{is_safe_char, Domain, DomainError};

/// Packing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("Nothing to pack")]
    EmptyInput,

    #[error("Character {ch:?} at offset {offset} is not domain-safe")]
    UnsafeCharacter { offset: usize, ch: char },

    #[error("Packed text must not start or end with a hyphen")]
    EdgeHyphen,

    #[error("Parent domain for chunk {sequence} leaves no room for payload")]
    NoCapacity { sequence: u64 },

    #[error("Hyphen run at offset {offset} cannot be split into valid labels")]
    HyphenRun { offset: usize },

    #[error("Invalid parent domain: {0}")]
    Domain(#[from] DomainError),

    #[error("Decoding error: {0}")]
    Decode(String),
}

/// Lazy, single-pass sequence of packed domains.
///
/// Produced by [`pack_text`] and [`pack_bytes`]. Once the payload is used up,
/// or after the first error, the iterator only returns `None`.
pub struct PackedDomains<F> {
    text: String,
    cursor: usize,
    sequence: u64,
    parent_for: F,
    fused: bool,
}

impl<F> PackedDomains<F>
where
    F: FnMut(u64) -> Result<Domain, DomainError>,
{
    /// Number of domains produced so far
    pub fn produced(&self) -> u64 {
        self.sequence
    }

    /// Payload characters not yet packed
    pub fn remaining(&self) -> usize {
        self.text.len() - self.cursor
    }

    /// Longest slice of at most `budget` chars, starting at the cursor, that
    /// forms a valid label and leaves the next slice without a leading hyphen.
    fn cut(&self, budget: usize) -> Option<usize> {
        let bytes = self.text.as_bytes();
        let start = self.cursor;
        (1..=budget).rev().find(|&n| {
            let end = start + n;
            bytes[end - 1] != b'-' && (end == bytes.len() || bytes[end] != b'-')
        })
    }

    fn fail(&mut self, err: PackError) -> Option<Result<Domain, PackError>> {
        self.fused = true;
        Some(Err(err))
    }
}

impl<F> Iterator for PackedDomains<F>
where
    F: FnMut(u64) -> Result<Domain, DomainError>,
{
    type Item = Result<Domain, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused || self.cursor >= self.text.len() {
            self.fused = true;
            return None;
        }

        let sequence = self.sequence;
        let mut domain = match (self.parent_for)(sequence) {
            Ok(domain) => domain,
            Err(e) => return self.fail(e.into()),
        };
        let level = domain.level();
        let mut packed = 0;

        loop {
            let budget = domain.max_next_label_length().min(self.remaining());
            if budget == 0 {
                break;
            }
            let Some(take) = self.cut(budget) else {
                break;
            };
            let label = &self.text[self.cursor..self.cursor + take];
            if let Err(e) = domain.prepend_at_level(label, level) {
                return self.fail(e.into());
            }
            self.cursor += take;
            packed += take;
        }

        if packed == 0 {
            let err = if domain.max_next_label_length() == 0 {
                PackError::NoCapacity { sequence }
            } else {
                PackError::HyphenRun { offset: self.cursor }
            };
            return self.fail(err);
        }

        log::trace!(
            "Packed chunk {} with {} chars ({} remaining)",
            sequence,
            packed,
            self.remaining()
        );

        self.sequence += 1;
        Some(Ok(domain))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.fused || self.cursor >= self.text.len() {
            (0, Some(0))
        } else {
            (1, Some(self.remaining()))
        }
    }
}

impl<F> FusedIterator for PackedDomains<F> where F: FnMut(u64) -> Result<Domain, DomainError> {}

/// Pack domain-safe text into domains built from `parent_for(sequence)`.
///
/// # Errors
///
/// Fails before producing anything if `input` is empty, contains a character
/// outside `[A-Za-z0-9-]`, or starts or ends with `-`.
pub fn pack_text<F>(input: impl Into<String>, parent_for: F) -> Result<PackedDomains<F>, PackError>
where
    F: FnMut(u64) -> Result<Domain, DomainError>,
{
    let text = input.into();
    if text.is_empty() {
        return Err(PackError::EmptyInput);
    }
    if let Some((offset, ch)) = text.char_indices().find(|(_, c)| !is_safe_char(*c)) {
        return Err(PackError::UnsafeCharacter { offset, ch });
    }
    if text.starts_with('-') || text.ends_with('-') {
        return Err(PackError::EdgeHyphen);
    }

    Ok(PackedDomains {
        text,
        cursor: 0,
        sequence: 0,
        parent_for,
        fused: false,
    })
}

/// Encode `data` as DNS-safe base32 and pack it with [`pack_text`]
pub fn pack_bytes<F>(data: &[u8], parent_for: F) -> Result<PackedDomains<F>, PackError>
where
    F: FnMut(u64) -> Result<Domain, DomainError>,
{
    if data.is_empty() {
        return Err(PackError::EmptyInput);
    }
    pack_text(BASE32_DNSSEC.encode(data), parent_for)
}

/// Length of the text [`pack_bytes`] packs for `len` payload bytes
pub fn packed_len(len: usize) -> usize {
    BASE32_DNSSEC.encode_len(len)
}

/// Decode payload labels, concatenated in sequence order, back into bytes.
///
/// Resolvers may randomise letter case on the way to the server, so labels
/// are lowercased before decoding.
pub fn unpack_labels<I, S>(labels: I) -> Result<Vec<u8>, PackError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let text: String = labels
        .into_iter()
        .map(|l| l.as_ref().to_ascii_lowercase())
        .collect();
    BASE32_DNSSEC
        .decode(text.as_bytes())
        .map_err(|e| PackError::Decode(e.to_string()))
}
