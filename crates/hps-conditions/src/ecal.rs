//! Electromagnetic calorimeter (ECal) conditions.
//!
//! Channel maps, gains, pedestals and bad channels are stored in separate tables. The
//! [`EcalConditionsConverter`] joins them by channel id into one [`EcalConditions`] object.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::{
    converter::{optional_collection, ConditionsDataConverter, MultipleCollectionsAction},
    data::{ConditionsObject, FieldValueMap, TableBacked},
    manager::DatabaseConditionsManager,
    models::FieldDescriptor,
    ConditionsResult, Id,
};

/// Key the aggregate ECal conditions are cached under.
pub const ECAL_CONDITIONS_KEY: &str = "ecal_conditions";

/// Crystal position and readout address of one calorimeter channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcalChannel {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
    pub(crate) x: i64,
    pub(crate) y: i64,
    #[serde(rename = "crate")]
    pub(crate) crate_number: i64,
    pub(crate) slot: i64,
    pub(crate) channel: i64,
}

impl EcalChannel {
    /// A channel that has not been stored yet.
    pub fn new(channel_id: i64, x: i64, y: i64, crate_number: i64, slot: i64, channel: i64) -> Self {
        Self {
            row_id: None,
            channel_id,
            x,
            y,
            crate_number,
            slot,
            channel,
        }
    }
    /// Channel id shared by every ECal table.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
    /// Crystal column.
    pub fn x(&self) -> i64 {
        self.x
    }
    /// Crystal row.
    pub fn y(&self) -> i64 {
        self.y
    }
    /// Readout crate.
    pub fn crate_number(&self) -> i64 {
        self.crate_number
    }
    /// Readout slot.
    pub fn slot(&self) -> i64 {
        self.slot
    }
    /// Channel within the slot.
    pub fn channel(&self) -> i64 {
        self.channel
    }
}

impl ConditionsObject for EcalChannel {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
            x: values.int("x")?,
            y: values.int("y")?,
            crate_number: values.int("crate")?,
            slot: values.int("slot")?,
            channel: values.int("channel")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(6);
        values.insert("channel_id", self.channel_id);
        values.insert("x", self.x);
        values.insert("y", self.y);
        values.insert("crate", self.crate_number);
        values.insert("slot", self.slot);
        values.insert("channel", self.channel);
        values
    }
}

impl TableBacked for EcalChannel {
    const TABLE_NAME: &'static str = "ecal_channels";
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("channel_id"),
        FieldDescriptor::int("x"),
        FieldDescriptor::int("y"),
        FieldDescriptor::int("crate"),
        FieldDescriptor::int("slot"),
        FieldDescriptor::int("channel"),
    ];
}

/// Gain of one channel, in MeV per ADC count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcalGain {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
    pub(crate) gain: f64,
}

impl EcalGain {
    /// A gain that has not been stored yet.
    pub fn new(channel_id: i64, gain: f64) -> Self {
        Self {
            row_id: None,
            channel_id,
            gain,
        }
    }
    /// Channel id.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
    /// Gain in MeV per ADC count.
    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl ConditionsObject for EcalGain {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
            gain: values.double("gain")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(2);
        values.insert("channel_id", self.channel_id);
        values.insert("gain", self.gain);
        values
    }
}

impl TableBacked for EcalGain {
    const TABLE_NAME: &'static str = "ecal_gains";
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("channel_id"),
        FieldDescriptor::double("gain"),
    ];
}

/// Pedestal and noise of one channel, in ADC counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcalCalibration {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
    pub(crate) pedestal: f64,
    pub(crate) noise: f64,
}

impl EcalCalibration {
    /// A calibration that has not been stored yet.
    pub fn new(channel_id: i64, pedestal: f64, noise: f64) -> Self {
        Self {
            row_id: None,
            channel_id,
            pedestal,
            noise,
        }
    }
    /// Channel id.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
    /// Pedestal in ADC counts.
    pub fn pedestal(&self) -> f64 {
        self.pedestal
    }
    /// Noise in ADC counts.
    pub fn noise(&self) -> f64 {
        self.noise
    }
}

impl ConditionsObject for EcalCalibration {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
            pedestal: values.double("pedestal")?,
            noise: values.double("noise")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(3);
        values.insert("channel_id", self.channel_id);
        values.insert("pedestal", self.pedestal);
        values.insert("noise", self.noise);
        values
    }
}

impl TableBacked for EcalCalibration {
    const TABLE_NAME: &'static str = "ecal_calibrations";
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("channel_id"),
        FieldDescriptor::double("pedestal"),
        FieldDescriptor::double("noise"),
    ];
}

/// A channel masked out of reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EcalBadChannel {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
}

impl EcalBadChannel {
    /// A bad channel that has not been stored yet.
    pub fn new(channel_id: i64) -> Self {
        Self {
            row_id: None,
            channel_id,
        }
    }
    /// Channel id.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
}

impl ConditionsObject for EcalBadChannel {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
        })
    }
    fn row_id(&self) -> Option<Id> {
        self.row_id
    }
    fn set_row_id(&mut self, row_id: Id) {
        self.row_id = Some(row_id);
    }
    fn field_values(&self) -> FieldValueMap {
        let mut values = FieldValueMap::with_capacity(1);
        values.insert("channel_id", self.channel_id);
        values
    }
}

impl TableBacked for EcalBadChannel {
    const TABLE_NAME: &'static str = "ecal_bad_channels";
    const FIELDS: &'static [FieldDescriptor] = &[FieldDescriptor::int("channel_id")];

    // Overlapping bad channel lists are merged.
    fn multiple_collections() -> MultipleCollectionsAction {
        MultipleCollectionsAction::Combine
    }
}

/// Everything known about one channel for the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcalChannelConstants {
    /// Position and readout address.
    pub channel: EcalChannel,
    /// Gain, if one was loaded.
    pub gain: Option<f64>,
    /// Pedestal, if a calibration was loaded.
    pub pedestal: Option<f64>,
    /// Noise, if a calibration was loaded.
    pub noise: Option<f64>,
    /// Listed as bad for the run.
    pub bad: bool,
}

/// Per-channel ECal constants, ordered by channel id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EcalConditions {
    channels: BTreeMap<i64, EcalChannelConstants>,
}

impl EcalConditions {
    /// Constants of one channel.
    pub fn get(&self, channel_id: i64) -> Option<&EcalChannelConstants> {
        self.channels.get(&channel_id)
    }
    /// Constants of the crystal at `(x, y)`.
    pub fn find_by_position(&self, x: i64, y: i64) -> Option<&EcalChannelConstants> {
        self.channels
            .values()
            .find(|constants| constants.channel.x == x && constants.channel.y == y)
    }
    /// Every channel, by channel id.
    pub fn channels(&self) -> impl Iterator<Item = &EcalChannelConstants> {
        self.channels.values()
    }
    /// Channels listed as bad.
    pub fn bad_channels(&self) -> impl Iterator<Item = &EcalChannelConstants> {
        self.channels.values().filter(|constants| constants.bad)
    }
    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }
    /// Returns true if no channels were loaded.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Builds [`EcalConditions`] from the channel, gain, calibration and bad channel tables.
#[derive(Debug, Clone, Copy)]
pub struct EcalConditionsConverter {
    include_bad_channels: bool,
}

impl Default for EcalConditionsConverter {
    fn default() -> Self {
        Self {
            include_bad_channels: true,
        }
    }
}

impl EcalConditionsConverter {
    /// The Test Run database has no bad channel table.
    pub fn test_run() -> Self {
        Self {
            include_bad_channels: false,
        }
    }
}

impl ConditionsDataConverter for EcalConditionsConverter {
    type Output = EcalConditions;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        _key: &str,
    ) -> ConditionsResult<Self::Output> {
        let include_bad_channels = self.include_bad_channels;
        manager.with_connection(|manager| {
            let channels = manager.get_collection::<EcalChannel>()?;
            let mut conditions = EcalConditions {
                channels: channels
                    .iter()
                    .map(|channel| {
                        (
                            channel.channel_id,
                            EcalChannelConstants {
                                channel: channel.clone(),
                                gain: None,
                                pedestal: None,
                                noise: None,
                                bad: false,
                            },
                        )
                    })
                    .collect(),
            };
            if let Some(gains) = optional_collection::<EcalGain>(manager)? {
                for gain in gains.iter() {
                    if let Some(constants) = conditions.channels.get_mut(&gain.channel_id) {
                        constants.gain = Some(gain.gain);
                    }
                }
            }
            if let Some(calibrations) = optional_collection::<EcalCalibration>(manager)? {
                for calibration in calibrations.iter() {
                    if let Some(constants) = conditions.channels.get_mut(&calibration.channel_id) {
                        constants.pedestal = Some(calibration.pedestal);
                        constants.noise = Some(calibration.noise);
                    }
                }
            }
            if include_bad_channels {
                if let Some(bad_channels) = optional_collection::<EcalBadChannel>(manager)? {
                    for bad in bad_channels.iter() {
                        if let Some(constants) = conditions.channels.get_mut(&bad.channel_id) {
                            constants.bad = true;
                        }
                    }
                }
            }
            debug!("built ECal conditions for {} channels", conditions.len());
            Ok(conditions)
        })
    }
}
