use std::{path::Path, time::Duration};

use hps_core::{run_periods::is_test_run, RunNumber};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::debug;
use xmltree::Element;

use crate::manager::ManagerSettings;

/// Errors raised while reading an XML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document is not well-formed XML.
    #[error("could not parse conditions configuration: {0}")]
    Xml(#[from] xmltree::ParseError),
    /// The configuration file could not be read.
    #[error("could not read conditions configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The document root is not `<conditions>`.
    #[error("expected <conditions> root element, found <{0}>")]
    UnexpectedRoot(String),
    /// A boolean switch is neither `true` nor `false`.
    #[error("invalid boolean {value:?} for {switch}")]
    InvalidBoolean {
        /// Switch name.
        switch: &'static str,
        /// Rejected text.
        value: String,
    },
    /// An integer switch could not be parsed.
    #[error("invalid integer {value:?} for {switch}")]
    InvalidInteger {
        /// Switch name.
        switch: &'static str,
        /// Rejected text.
        value: String,
    },
}

/// Switches read from the `<configuration>` element. Absent switches are `None` and leave the
/// current settings untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionsConfig {
    /// `setupSvtDetector`
    pub setup_svt_detector: Option<bool>,
    /// `setupEcalDetector`
    pub setup_ecal_detector: Option<bool>,
    /// `ecalName`, the ECal name in the detector description
    pub ecal_name: Option<String>,
    /// `svtName`, the SVT name in the detector description
    pub svt_name: Option<String>,
    /// `freezeAfterInitialize`
    pub freeze_after_initialize: Option<bool>,
    /// `cacheAllCondition`
    pub cache_all_conditions: Option<bool>,
    /// `isTestRun`
    pub is_test_run: Option<bool>,
    /// `closeConnectionAfterInitialize`
    pub close_connection_after_initialize: Option<bool>,
    /// `loginTimeout`, in seconds
    pub login_timeout: Option<Duration>,
}

fn child_text(node: &Element, name: &str) -> Option<String> {
    node.get_child(name)
        .map(|child| child.get_text().map(|t| t.trim().to_string()).unwrap_or_default())
}

fn bool_switch(node: &Element, switch: &'static str) -> Result<Option<bool>, ConfigError> {
    child_text(node, switch)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ConfigError::InvalidBoolean { switch, value }),
        })
        .transpose()
}

impl ConditionsConfig {
    /// Parses a `<conditions>` document. A missing `<configuration>` element yields no switches.
    pub fn parse(xml: &str) -> Result<Self, ConfigError> {
        let root = Element::parse(xml.as_bytes())?;
        if root.name != "conditions" {
            return Err(ConfigError::UnexpectedRoot(root.name));
        }
        let Some(node) = root.get_child("configuration") else {
            return Ok(Self::default());
        };
        let login_timeout = child_text(node, "loginTimeout")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidInteger {
                        switch: "loginTimeout",
                        value,
                    })
            })
            .transpose()?;
        Ok(Self {
            setup_svt_detector: bool_switch(node, "setupSvtDetector")?,
            setup_ecal_detector: bool_switch(node, "setupEcalDetector")?,
            ecal_name: child_text(node, "ecalName"),
            svt_name: child_text(node, "svtName"),
            freeze_after_initialize: bool_switch(node, "freezeAfterInitialize")?,
            cache_all_conditions: bool_switch(node, "cacheAllCondition")?,
            is_test_run: bool_switch(node, "isTestRun")?,
            close_connection_after_initialize: bool_switch(
                node,
                "closeConnectionAfterInitialize",
            )?,
            login_timeout,
        })
    }

    /// Reads and parses an XML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Copies every switch that is present onto `settings`.
    pub fn apply(&self, settings: &mut ManagerSettings) {
        let switches = [
            (self.setup_svt_detector, &mut settings.setup_svt_detector),
            (self.setup_ecal_detector, &mut settings.setup_ecal_detector),
            (
                self.freeze_after_initialize,
                &mut settings.freeze_after_initialize,
            ),
            (self.cache_all_conditions, &mut settings.cache_all_conditions),
            (self.is_test_run, &mut settings.is_test_run),
            (
                self.close_connection_after_initialize,
                &mut settings.close_connection_after_initialize,
            ),
        ];
        for (value, setting) in switches {
            if let Some(value) = value {
                *setting = value;
            }
        }
        if let Some(name) = &self.ecal_name {
            settings.ecal_name.clone_from(name);
        }
        if let Some(name) = &self.svt_name {
            settings.svt_name.clone_from(name);
        }
        if let Some(timeout) = self.login_timeout {
            settings.login_timeout = timeout;
        }
        debug!("applied conditions configuration: {settings:?}");
    }
}

/// XML configurations shipped with the crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ConfigResource {
    /// `conditions_prod.xml`
    #[strum(serialize = "prod")]
    Production,
    /// `conditions_testrun_2012.xml`
    TestRun2012,
    /// `conditions_engrun.xml`
    EngRun,
}

impl ConfigResource {
    /// The bundled XML text.
    pub fn xml(&self) -> &'static str {
        match self {
            Self::Production => include_str!("../resources/conditions_prod.xml"),
            Self::TestRun2012 => include_str!("../resources/conditions_testrun_2012.xml"),
            Self::EngRun => include_str!("../resources/conditions_engrun.xml"),
        }
    }

    /// Parses the bundled XML.
    pub fn load(&self) -> Result<ConditionsConfig, ConfigError> {
        ConditionsConfig::parse(self.xml())
    }

    /// The configuration for the run period `run` belongs to.
    pub fn for_run(run: RunNumber) -> Self {
        if is_test_run(run) {
            Self::TestRun2012
        } else {
            Self::EngRun
        }
    }
}
