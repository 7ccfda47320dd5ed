//! DNS domain name value type
//!
//! A [`Domain`] is an ordered list of labels, leftmost first, that always
//! satisfies the RFC 1035 limits the tunnel depends on:
//!
//! - every label is 1..=63 octets long
//! - labels only use the domain-safe alphabet `[A-Za-z0-9-]`
//! - no label starts or ends with `-`
//! - the whole name is at most 255 octets in wire form
//!
//! Labels are addressed by *level*: a label at level `L` has exactly `L`
//! labels to its right. Inserting several labels at the same level keeps them
//! in reading order, which is what the packer relies on to lay payload text
//! out left to right in front of a fixed suffix.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum length of a name in wire form, root octet included (RFC 1035)
pub const MAX_NAME_LEN: usize = 255;

/// Domain name validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Empty label")]
    EmptyLabel,

    #[error("Label too long: {0} bytes (max: 63)")]
    LabelTooLong(usize),

    #[error("Invalid character {ch:?} in label {label:?}")]
    InvalidCharacter { label: String, ch: char },

    #[error("Label {0:?} starts or ends with a hyphen")]
    EdgeHyphen(String),

    #[error("Name too long: {0} bytes (max: 255)")]
    NameTooLong(usize),

    #[error("Level {level} out of range for a name with {depth} labels")]
    LevelOutOfRange { level: usize, depth: usize },
}

/// Check whether a character belongs to the domain-safe alphabet
pub fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Validate a single label against the alphabet and length rules
pub fn validate_label(label: &str) -> Result<(), DomainError> {
    if label.is_empty() {
        return Err(DomainError::EmptyLabel);
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(DomainError::LabelTooLong(label.len()));
    }
    if let Some(ch) = label.chars().find(|c| !is_safe_char(*c)) {
        return Err(DomainError::InvalidCharacter {
            label: label.to_string(),
            ch,
        });
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(DomainError::EdgeHyphen(label.to_string()));
    }
    Ok(())
}

/// A syntactically valid DNS name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Domain {
    labels: Vec<String>,
}

impl Domain {
    /// The root name (no labels)
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a name from labels given leftmost first
    pub fn from_labels<I, S>(labels: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        for label in &labels {
            validate_label(label)?;
        }
        let domain = Self { labels };
        let wire_len = domain.wire_len();
        if wire_len > MAX_NAME_LEN {
            return Err(DomainError::NameTooLong(wire_len));
        }
        Ok(domain)
    }

    /// Labels, leftmost first
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of labels in the name
    pub fn level(&self) -> usize {
        self.labels.len()
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Length of the name in wire form: one length octet per label plus the
    /// terminating root octet
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Largest label that can still be inserted without breaking either the
    /// per-label or the whole-name limit. Zero means the name is full.
    pub fn max_next_label_length(&self) -> usize {
        // a new label costs its length plus one length octet
        MAX_NAME_LEN
            .saturating_sub(self.wire_len())
            .saturating_sub(1)
            .min(MAX_LABEL_LEN)
    }

    /// Return a copy of this name with `label` as the new leftmost label
    pub fn prepend(&self, label: impl AsRef<str>) -> Result<Domain, DomainError> {
        let mut domain = self.clone();
        domain.prepend_at_level(label, self.level())?;
        Ok(domain)
    }

    /// Insert `label` so that exactly `level` labels lie to its right
    pub fn prepend_at_level(&mut self, label: impl AsRef<str>, level: usize) -> Result<(), DomainError> {
        let label = label.as_ref();
        validate_label(label)?;

        let depth = self.labels.len();
        if level > depth {
            return Err(DomainError::LevelOutOfRange { level, depth });
        }
        let wire_len = self.wire_len() + label.len() + 1;
        if wire_len > MAX_NAME_LEN {
            return Err(DomainError::NameTooLong(wire_len));
        }

        self.labels.insert(depth - level, label.to_string());
        Ok(())
    }

    /// Whether `self` ends with all labels of `suffix` (ASCII case-insensitive)
    pub fn ends_with(&self, suffix: &Domain) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let offset = self.labels.len() - suffix.labels.len();
        self.labels[offset..]
            .iter()
            .zip(&suffix.labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        write!(f, "{}", self.labels.join("."))
    }
}

impl FromStr for Domain {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Domain::root());
        }
        Domain::from_labels(s.split('.'))
    }
}
