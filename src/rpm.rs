//! RPM name and version utilities
//!
//! Parses NEVRA and EVR strings and decomposes RPM version strings into
//! arrays whose lexicographic order reproduces librpm's version ordering:
//! `"1.10" > "1.9"`, `"1.0~rc1" < "1.0"`, `"1.0^git" > "1.0"`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::EvalError;

// Epoch may appear before the name (E:N-V-R.A) or between name and
// version (N-E:V-R.A), never both.
static NEVRA_EPOCH_FIRST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<epoch>[0-9]+):(?P<name>[^:]+)-(?P<ver>[^-:]+)-(?P<rel>[^-:]+)\.(?P<arch>[a-z0-9_]+)$")
        .unwrap()
});
static NEVRA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[^:]+)-(?:(?P<epoch>[0-9]+):)?(?P<ver>[^-:]+)-(?P<rel>[^-:]+)\.(?P<arch>[a-z0-9_]+)$")
        .unwrap()
});
static EVR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<epoch>[0-9]+):)?(?P<ver>[^-:]+)-(?P<rel>[^-:]+)$").unwrap()
});
static VERSION_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(~*)([A-Za-z]+|\d+)(\^*)").unwrap());

/// Parsed RPM package identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nevra {
    pub name: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch == "0" {
            write!(f, "{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
        } else {
            write!(
                f,
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        }
    }
}

/// Epoch, version, release triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Evr {
    pub epoch: String,
    pub version: String,
    pub release: String,
}

/// Parse an RPM file name (with or without the `.rpm` suffix) into its
/// NEVRA components. A missing epoch defaults to `"0"`.
pub fn parse_nevra(rpm_name: &str) -> Result<Nevra, EvalError> {
    let trimmed = rpm_name.strip_suffix(".rpm").unwrap_or(rpm_name);

    let caps = NEVRA_EPOCH_FIRST_RE
        .captures(trimmed)
        .or_else(|| NEVRA_RE.captures(trimmed))
        .ok_or_else(|| EvalError::MalformedNevra(rpm_name.to_string()))?;

    Ok(Nevra {
        name: caps["name"].to_string(),
        epoch: caps.name("epoch").map_or_else(|| "0".to_string(), |m| m.as_str().to_string()),
        version: caps["ver"].to_string(),
        release: caps["rel"].to_string(),
        arch: caps["arch"].to_string(),
    })
}

/// Parse an `[E:]V-R` string; a missing epoch defaults to `"0"`.
pub fn parse_evr(evr: &str) -> Result<Evr, EvalError> {
    let caps = EVR_RE
        .captures(evr)
        .ok_or_else(|| EvalError::MalformedEvr(evr.to_string()))?;

    Ok(Evr {
        epoch: caps.name("epoch").map_or_else(|| "0".to_string(), |m| m.as_str().to_string()),
        version: caps["ver"].to_string(),
        release: caps["rel"].to_string(),
    })
}

/// Comparable decomposition of an RPM version string
pub type VersionArray = Vec<(i64, String)>;

/// Convert an RPM version string into an array of `(num, word)` pairs whose
/// pairwise lexicographic order matches RPM's version ordering.
///
/// A `~` prefix sorts the segment below anything including the end of the
/// string (`-3`), a `^` suffix adds a marker sorting between "string ended"
/// and a regular segment (`-1`), and a terminating `(-2, "")` makes a string
/// sort below its own extensions.
pub fn rpmver2array(rpm_version: &str) -> VersionArray {
    let mut arr = Vec::new();
    for caps in VERSION_TOKEN_RE.captures_iter(rpm_version) {
        let tilde = !caps[1].is_empty();
        let token = &caps[2];
        let caret = !caps[3].is_empty();
        let is_digits = token.as_bytes()[0].is_ascii_digit();

        let (num, word) = if tilde {
            (-3, if is_digits { String::new() } else { token.to_string() })
        } else if is_digits {
            (parse_digit_run(token), String::new())
        } else {
            (0, token.to_string())
        };

        arr.push((num, word));
        if caret {
            arr.push((-1, String::new()));
        }
    }
    arr.push((-2, String::new()));
    arr
}

// Digit runs longer than i64 saturate; no real-world version gets there.
fn parse_digit_run(token: &str) -> i64 {
    let significant = token.trim_start_matches('0');
    if significant.is_empty() {
        return 0;
    }
    significant.parse().unwrap_or(i64::MAX)
}
