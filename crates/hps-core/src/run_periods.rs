//! HPS run periods and the run-number thresholds that separate them.

use lazy_static::lazy_static;
use std::{collections::HashMap, str::FromStr};

use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

use crate::RunNumber;

/// Largest run number recorded during the 2012 Test Run.
pub const TEST_RUN_MAX_RUN: RunNumber = 1365;

/// Largest run number accepted anywhere in the conditions system.
pub const MAX_RUN_NUMBER: RunNumber = 2_147_483_647;

/// Data-taking periods with distinct detector geometries.
#[derive(Copy, Clone, Debug, EnumIter, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunPeriod {
    /// 2012 Test Run
    TestRun2012,
    /// Engineering runs; every run after the Test Run is treated as one
    EngRun,
}

impl RunPeriod {
    /// First run number of the period.
    pub fn min_run(&self) -> RunNumber {
        match self {
            Self::TestRun2012 => 1,
            Self::EngRun => TEST_RUN_MAX_RUN + 1,
        }
    }

    /// Last run number of the period.
    pub fn max_run(&self) -> RunNumber {
        match self {
            Self::TestRun2012 => TEST_RUN_MAX_RUN,
            Self::EngRun => MAX_RUN_NUMBER,
        }
    }

    /// Lowercase name used in file names and configuration.
    pub fn short_name(&self) -> &str {
        match self {
            Self::TestRun2012 => "testrun",
            Self::EngRun => "engrun",
        }
    }

    /// Name of the detector description used when a caller does not pick one.
    pub fn default_detector(&self) -> &'static str {
        DEFAULT_DETECTORS
            .get(self)
            .copied()
            .unwrap_or(DEFAULT_ENG_RUN_DETECTOR)
    }

    /// Returns true if `run` falls inside the period's range.
    pub fn contains(&self, run: RunNumber) -> bool {
        run >= self.min_run() && run <= self.max_run()
    }
}

/// Returns true if the run number belongs to the 2012 Test Run.
pub fn is_test_run(run: RunNumber) -> bool {
    run > 0 && run <= TEST_RUN_MAX_RUN
}

/// Default detector for the 2012 Test Run.
pub const DEFAULT_TEST_RUN_DETECTOR: &str = "HPS-TestRun-v8-5";

/// Default detector for the Engineering Run.
pub const DEFAULT_ENG_RUN_DETECTOR: &str = "HPS-Proposal2014-v8-6pt6";

lazy_static! {
    static ref DEFAULT_DETECTORS: HashMap<RunPeriod, &'static str> = {
        let mut m = HashMap::new();
        m.insert(RunPeriod::TestRun2012, DEFAULT_TEST_RUN_DETECTOR);
        m.insert(RunPeriod::EngRun, DEFAULT_ENG_RUN_DETECTOR);
        m
    };
}

/// Errors raised while looking up or parsing a [`RunPeriod`].
#[derive(Error, Debug)]
pub enum RunPeriodError {
    /// No run period covers the run number.
    #[error("Run number {0} not in range of any known run period")]
    UnknownRunPeriodError(RunNumber),
    /// The string is not a known run period name.
    #[error("Could not parse run period from string {0}")]
    RunPeriodParseError(String),
}

impl FromStr for RunPeriod {
    type Err = RunPeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "testrun" | "test_run" | "tr2012" => Ok(Self::TestRun2012),
            "engrun" | "eng_run" => Ok(Self::EngRun),
            _ => Err(RunPeriodError::RunPeriodParseError(s.to_string())),
        }
    }
}

impl TryFrom<RunNumber> for RunPeriod {
    type Error = RunPeriodError;

    fn try_from(value: RunNumber) -> Result<Self, Self::Error> {
        RunPeriod::iter()
            .find(|rp: &RunPeriod| rp.contains(value))
            .ok_or(RunPeriodError::UnknownRunPeriodError(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_threshold() {
        assert!(!is_test_run(0));
        assert!(is_test_run(1));
        assert!(is_test_run(TEST_RUN_MAX_RUN));
        assert!(!is_test_run(TEST_RUN_MAX_RUN + 1));
        assert!(!is_test_run(-1));
    }

    #[test]
    fn run_period_from_run_number() {
        assert_eq!(RunPeriod::try_from(1351).unwrap(), RunPeriod::TestRun2012);
        assert_eq!(RunPeriod::try_from(5772).unwrap(), RunPeriod::EngRun);
        assert!(RunPeriod::try_from(0).is_err());
    }

    #[test]
    fn default_detectors() {
        assert_eq!(
            RunPeriod::TestRun2012.default_detector(),
            DEFAULT_TEST_RUN_DETECTOR
        );
        assert_eq!(RunPeriod::EngRun.default_detector(), DEFAULT_ENG_RUN_DETECTOR);
    }

    #[test]
    fn parses_short_names() {
        for rp in RunPeriod::iter() {
            assert_eq!(rp.short_name().parse::<RunPeriod>().unwrap(), rp);
        }
    }
}
