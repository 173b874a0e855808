use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VersionParseError {
    #[error("invalid version '{input}': {source}")]
    Malformed {
        input: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid version '{input}': pre-release and build suffixes are not supported")]
    Qualified { input: String },
}

/// Installed or released firmware version: a plain `major.minor.patch`
/// triple, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FirmwareVersion {
    /// Version assumed when nothing has ever been recorded on the device.
    pub const UNKNOWN: Self = Self::new(0, 0, 0);

    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a decimal-dot version, accepting a single leading `v` as release
    /// tags carry it.
    ///
    /// # Errors
    /// Returns an error on a non-numeric component, a component count other
    /// than three, or a pre-release/build suffix.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let parsed = semver::Version::parse(&without_leading_zeros(core)).map_err(|source| {
            VersionParseError::Malformed {
                input: input.to_string(),
                source,
            }
        })?;

        if !parsed.pre.is_empty() || !parsed.build.is_empty() {
            return Err(VersionParseError::Qualified {
                input: input.to_string(),
            });
        }

        Ok(Self::new(parsed.major, parsed.minor, parsed.patch))
    }
}

impl FromStr for FirmwareVersion {
    type Err = VersionParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// `1.02.0` is a valid device version even though semver forbids the zero.
fn without_leading_zeros(core: &str) -> String {
    let (numbers, suffix) = core
        .find(['-', '+'])
        .map_or((core, ""), |at| core.split_at(at));
    let numbers: Vec<&str> = numbers
        .split('.')
        .map(|part| {
            if part.len() > 1 && part.bytes().all(|b| b.is_ascii_digit()) {
                let trimmed = part.trim_start_matches('0');
                if trimmed.is_empty() { "0" } else { trimmed }
            } else {
                part
            }
        })
        .collect();
    format!("{}{suffix}", numbers.join("."))
}

#[must_use]
pub fn compare(left: &FirmwareVersion, right: &FirmwareVersion) -> Ordering {
    left.cmp(right)
}

/// Parse and compare two version strings.
///
/// # Errors
/// Returns an error if either side is not a valid `major.minor.patch` version.
pub fn compare_str(left: &str, right: &str) -> Result<Ordering, VersionParseError> {
    Ok(compare(
        &FirmwareVersion::parse(left)?,
        &FirmwareVersion::parse(right)?,
    ))
}
