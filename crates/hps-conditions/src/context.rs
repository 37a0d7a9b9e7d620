use std::{fmt::Display, str::FromStr};

use hps_core::run_periods::MAX_RUN_NUMBER;
use thiserror::Error;

use crate::RunNumber;

/// Errors raised while parsing a [`Request`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseRequestError {
    /// The key before the first `:` is empty.
    #[error("request has an empty conditions key")]
    EmptyKey,
    /// The key holds characters other than ASCII letters, digits and `_`.
    #[error("illegal character encountered in key \"{0}\"")]
    IllegalCharacter(String),
    /// The run segment is not an integer.
    #[error("invalid run number: {0}")]
    InvalidRunNumberError(String),
    /// The run segment is negative or larger than [`MAX_RUN_NUMBER`].
    #[error("run number {0} is outside 0..={max}", max = MAX_RUN_NUMBER)]
    RunNumberOutOfRange(RunNumber),
}

/// A conditions lookup written as `key[:run[:tag]]`.
///
/// Empty run or tag segments are treated as absent, so `ecal_gains::pass1` names a tag without a
/// run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Conditions key, usually a table name.
    pub key: String,
    /// Run to initialize the manager for.
    pub run: Option<RunNumber>,
    /// Tag to restrict conditions records to.
    pub tag: Option<String>,
}

impl Request {
    /// A request for `key` with no run or tag.
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            run: None,
            tag: None,
        }
    }
    /// Sets the run.
    pub fn with_run(mut self, run: RunNumber) -> Self {
        self.run = Some(run);
        self
    }
    /// Sets the tag.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

impl FromStr for Request {
    type Err = ParseRequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            return Err(ParseRequestError::EmptyKey);
        }
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ParseRequestError::IllegalCharacter(key.to_string()));
        }
        let mut request = Request::new(key);
        if let Some(run_s) = parts.next().map(str::trim).filter(|r| !r.is_empty()) {
            let run = run_s
                .parse::<RunNumber>()
                .map_err(|_| ParseRequestError::InvalidRunNumberError(run_s.to_string()))?;
            if !(0..=MAX_RUN_NUMBER).contains(&run) {
                return Err(ParseRequestError::RunNumberOutOfRange(run));
            }
            request = request.with_run(run);
        }
        if let Some(tag) = parts.next().map(str::trim).filter(|t| !t.is_empty()) {
            request = request.with_tag(tag);
        }
        Ok(request)
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)?;
        match (&self.run, &self.tag) {
            (None, None) => Ok(()),
            (Some(run), None) => write!(f, ":{run}"),
            (None, Some(tag)) => write!(f, "::{tag}"),
            (Some(run), Some(tag)) => write!(f, ":{run}:{tag}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_only() {
        let request: Request = "ecal_gains".parse().unwrap();
        assert_eq!(request, Request::new("ecal_gains"));
    }

    #[test]
    fn key_run_and_tag() {
        let request: Request = "svt_gains:5772:pass1".parse().unwrap();
        assert_eq!(request.key, "svt_gains");
        assert_eq!(request.run, Some(5772));
        assert_eq!(request.tag.as_deref(), Some("pass1"));
        assert_eq!(request.to_string(), "svt_gains:5772:pass1");
    }

    #[test]
    fn empty_run_segment_keeps_tag() {
        let request: Request = "ecal_gains::pass1".parse().unwrap();
        assert_eq!(request.run, None);
        assert_eq!(request.tag.as_deref(), Some("pass1"));
        assert_eq!(request.to_string(), "ecal_gains::pass1");
    }

    #[test]
    fn bad_requests() {
        assert_eq!(
            "".parse::<Request>().unwrap_err(),
            ParseRequestError::EmptyKey
        );
        assert_eq!(
            "ecal gains".parse::<Request>().unwrap_err(),
            ParseRequestError::IllegalCharacter("ecal gains".to_string())
        );
        assert_eq!(
            "ecal_gains:abc".parse::<Request>().unwrap_err(),
            ParseRequestError::InvalidRunNumberError("abc".to_string())
        );
    }

    #[test]
    fn out_of_range_runs_are_rejected() {
        assert_eq!(
            "ecal_gains:-5".parse::<Request>().unwrap_err(),
            ParseRequestError::RunNumberOutOfRange(-5)
        );
        assert_eq!(
            "ecal_gains:2147483648:pass1".parse::<Request>().unwrap_err(),
            ParseRequestError::RunNumberOutOfRange(2_147_483_648)
        );
        let request: Request = "ecal_gains:0".parse().unwrap();
        assert_eq!(request.run, Some(0));
    }
}
