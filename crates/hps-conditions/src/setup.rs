//! Hooks that hand freshly loaded conditions to sub-detector code.
//!
//! Setups run after every initialization of the manager. A failing setup is logged and never
//! stops initialization.

use std::sync::Arc;

use strum::{Display, EnumString};
use tracing::info;

use crate::{
    ecal::{EcalConditions, ECAL_CONDITIONS_KEY},
    manager::DatabaseConditionsManager,
    svt::{SvtConditions, SVT_CONDITIONS_KEY},
    ConditionsResult,
};

/// Sub-detectors with conditions setups.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString)]
pub enum SubDetector {
    /// Electromagnetic calorimeter
    Ecal,
    /// Silicon vertex tracker
    Svt,
}

/// Receives conditions each time the manager is initialized for a new run.
pub trait DetectorSetup {
    /// The sub-detector this setup configures.
    fn subdetector(&self) -> SubDetector;
    /// Name of the sub-detector in the detector description.
    fn set_subdetector_name(&mut self, name: &str);
    /// Called after the manager loads its conditions records for a new run.
    fn conditions_changed(&mut self, manager: &mut DatabaseConditionsManager) -> ConditionsResult<()>;
}

type Sink<C> = Box<dyn FnMut(&str, Arc<C>) + Send>;

/// Passes the run's [`EcalConditions`] to a caller-supplied sink.
pub struct EcalDetectorSetup {
    name: String,
    sink: Sink<EcalConditions>,
}

impl EcalDetectorSetup {
    /// A setup that calls `sink` with the sub-detector name and its conditions.
    pub fn new(sink: impl FnMut(&str, Arc<EcalConditions>) + Send + 'static) -> Self {
        Self {
            name: String::new(),
            sink: Box::new(sink),
        }
    }
}

impl DetectorSetup for EcalDetectorSetup {
    fn subdetector(&self) -> SubDetector {
        SubDetector::Ecal
    }
    fn set_subdetector_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn conditions_changed(&mut self, manager: &mut DatabaseConditionsManager) -> ConditionsResult<()> {
        let conditions = manager.get_cached_conditions::<EcalConditions>(ECAL_CONDITIONS_KEY)?;
        info!("loading {} ECal channels into {}", conditions.len(), self.name);
        (self.sink)(&self.name, conditions);
        Ok(())
    }
}

/// Passes the run's [`SvtConditions`] to a caller-supplied sink.
pub struct SvtDetectorSetup {
    name: String,
    sink: Sink<SvtConditions>,
}

impl SvtDetectorSetup {
    /// A setup that calls `sink` with the sub-detector name and its conditions.
    pub fn new(sink: impl FnMut(&str, Arc<SvtConditions>) + Send + 'static) -> Self {
        Self {
            name: String::new(),
            sink: Box::new(sink),
        }
    }
}

impl DetectorSetup for SvtDetectorSetup {
    fn subdetector(&self) -> SubDetector {
        SubDetector::Svt
    }
    fn set_subdetector_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn conditions_changed(&mut self, manager: &mut DatabaseConditionsManager) -> ConditionsResult<()> {
        let conditions = manager.get_cached_conditions::<SvtConditions>(SVT_CONDITIONS_KEY)?;
        info!("loading {} SVT channels into {}", conditions.len(), self.name);
        (self.sink)(&self.name, conditions);
        Ok(())
    }
}
