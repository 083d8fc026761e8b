use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SIREN of La Poste, whose establishments do not follow the Luhn rule.
const LA_POSTE_SIREN: &str = "356000000";

/// A 14-digit establishment identifier from the French business registry.
///
/// Parsing only checks the shape. Callers capturing a SIRET from a user
/// should additionally require [`Siret::has_valid_checksum`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Siret(String);

impl Siret {
    pub const LEN: usize = 14;

    /// Parses a SIRET, ignoring surrounding whitespace and inner spaces.
    pub fn parse(raw: &str) -> Result<Self, SiretError> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(SiretError::Empty);
        }
        if !compact.chars().all(|c| c.is_ascii_digit()) {
            return Err(SiretError::NonDigit(compact));
        }
        if compact.len() != Self::LEN {
            return Err(SiretError::Length(compact.len()));
        }
        Ok(Self(compact))
    }

    /// Parses and also requires a valid checksum.
    pub fn parse_checked(raw: &str) -> Result<Self, SiretError> {
        let siret = Self::parse(raw)?;
        if !siret.has_valid_checksum() {
            return Err(SiretError::Checksum(siret.0));
        }
        Ok(siret)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SIREN of the legal entity owning the establishment.
    pub fn siren(&self) -> &str {
        &self.0[..9]
    }

    /// Luhn check, with La Poste's digit-sum rule as the one exception.
    pub fn has_valid_checksum(&self) -> bool {
        if self.siren() == LA_POSTE_SIREN {
            let sum: u32 = self.digits().sum();
            return sum % 5 == 0;
        }
        luhn_sum(self.digits()) % 10 == 0
    }

    fn digits(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.0.bytes().map(|b| u32::from(b - b'0'))
    }
}

fn luhn_sum(digits: impl DoubleEndedIterator<Item = u32>) -> u32 {
    digits
        .rev()
        .enumerate()
        .map(|(idx, digit)| {
            if idx % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum()
}

impl fmt::Display for Siret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Siret {
    type Error = SiretError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Siret> for String {
    fn from(value: Siret) -> Self {
        value.0
    }
}

/// Reasons a SIRET is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiretError {
    #[error("siret is empty")]
    Empty,
    #[error("siret must only contain digits (got {0})")]
    NonDigit(String),
    #[error("siret must be 14 digits long (got {0})")]
    Length(usize),
    #[error("siret {0} has an invalid checksum")]
    Checksum(String),
}
