//! Silicon vertex tracker (SVT) conditions.

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

/// Key the aggregate SVT conditions are cached under.
pub const SVT_CONDITIONS_KEY: &str = "svt_conditions";

/// Readout address of one strip: front-end board, hybrid on that board, and channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SvtChannel {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
    pub(crate) feb_id: i64,
    pub(crate) feb_hybrid_id: i64,
    pub(crate) channel: i64,
}

impl SvtChannel {
    /// A channel that has not been stored yet.
    pub fn new(channel_id: i64, feb_id: i64, feb_hybrid_id: i64, channel: i64) -> Self {
        Self {
            row_id: None,
            channel_id,
            feb_id,
            feb_hybrid_id,
            channel,
        }
    }
    /// Channel id shared by every SVT table.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
    /// Front end board id.
    pub fn feb_id(&self) -> i64 {
        self.feb_id
    }
    /// Hybrid on the front end board.
    pub fn feb_hybrid_id(&self) -> i64 {
        self.feb_hybrid_id
    }
    /// Strip within the hybrid.
    pub fn channel(&self) -> i64 {
        self.channel
    }
}

impl ConditionsObject for SvtChannel {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
            feb_id: values.int("feb_id")?,
            feb_hybrid_id: values.int("feb_hybrid_id")?,
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
        let mut values = FieldValueMap::with_capacity(4);
        values.insert("channel_id", self.channel_id);
        values.insert("feb_id", self.feb_id);
        values.insert("feb_hybrid_id", self.feb_hybrid_id);
        values.insert("channel", self.channel);
        values
    }
}

impl TableBacked for SvtChannel {
    const TABLE_NAME: &'static str = "svt_channels";
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("channel_id"),
        FieldDescriptor::int("feb_id"),
        FieldDescriptor::int("feb_hybrid_id"),
        FieldDescriptor::int("channel"),
    ];
}

/// Gain and offset of one strip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SvtGain {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
    pub(crate) gain: f64,
    pub(crate) offset: f64,
}

impl SvtGain {
    /// A gain that has not been stored yet.
    pub fn new(channel_id: i64, gain: f64, offset: f64) -> Self {
        Self {
            row_id: None,
            channel_id,
            gain,
            offset,
        }
    }
    /// Channel id.
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
    /// Gain.
    pub fn gain(&self) -> f64 {
        self.gain
    }
    /// Offset.
    pub fn offset(&self) -> f64 {
        self.offset
    }
}

impl ConditionsObject for SvtGain {
    fn from_field_values(row_id: Option<Id>, values: &FieldValueMap) -> ConditionsResult<Self> {
        Ok(Self {
            row_id,
            channel_id: values.int("channel_id")?,
            gain: values.double("gain")?,
            offset: values.double("offset")?,
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
        values.insert("gain", self.gain);
        values.insert("offset", self.offset);
        values
    }
}

impl TableBacked for SvtGain {
    const TABLE_NAME: &'static str = "svt_gains";
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor::int("channel_id"),
        FieldDescriptor::double("gain"),
        FieldDescriptor::double("offset"),
    ];
}

/// A strip masked out of reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SvtBadChannel {
    #[serde(skip)]
    pub(crate) row_id: Option<Id>,
    pub(crate) channel_id: i64,
}

impl SvtBadChannel {
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

impl ConditionsObject for SvtBadChannel {
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

impl TableBacked for SvtBadChannel {
    const TABLE_NAME: &'static str = "svt_bad_channels";
    const FIELDS: &'static [FieldDescriptor] = &[FieldDescriptor::int("channel_id")];

    fn multiple_collections() -> MultipleCollectionsAction {
        MultipleCollectionsAction::Combine
    }
}

/// Everything known about one strip for the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SvtChannelConstants {
    /// Readout address.
    pub channel: SvtChannel,
    /// Gain, if one was loaded.
    pub gain: Option<f64>,
    /// Offset, if a gain was loaded.
    pub offset: Option<f64>,
    /// Listed as bad for the run.
    pub bad: bool,
}

/// Per-strip SVT constants, ordered by channel id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SvtConditions {
    channels: BTreeMap<i64, SvtChannelConstants>,
}

impl SvtConditions {
    /// Constants of one strip.
    pub fn get(&self, channel_id: i64) -> Option<&SvtChannelConstants> {
        self.channels.get(&channel_id)
    }
    /// Constants of the strip at a readout address.
    pub fn find_by_address(
        &self,
        feb_id: i64,
        feb_hybrid_id: i64,
        channel: i64,
    ) -> Option<&SvtChannelConstants> {
        self.channels.values().find(|constants| {
            constants.channel.feb_id == feb_id
                && constants.channel.feb_hybrid_id == feb_hybrid_id
                && constants.channel.channel == channel
        })
    }
    /// Every strip, by channel id.
    pub fn channels(&self) -> impl Iterator<Item = &SvtChannelConstants> {
        self.channels.values()
    }
    /// Strips listed as bad.
    pub fn bad_channels(&self) -> impl Iterator<Item = &SvtChannelConstants> {
        self.channels.values().filter(|constants| constants.bad)
    }
    /// Number of strips.
    pub fn len(&self) -> usize {
        self.channels.len()
    }
    /// Returns true if no strips were loaded.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Builds [`SvtConditions`] from the channel, gain and bad channel tables.
#[derive(Debug, Clone, Copy)]
pub struct SvtConditionsConverter {
    include_bad_channels: bool,
}

impl Default for SvtConditionsConverter {
    fn default() -> Self {
        Self {
            include_bad_channels: true,
        }
    }
}

impl SvtConditionsConverter {
    /// The Test Run variant, which has no bad channel table.
    pub fn test_run() -> Self {
        Self {
            include_bad_channels: false,
        }
    }
}

impl ConditionsDataConverter for SvtConditionsConverter {
    type Output = SvtConditions;

    fn get_data(
        &self,
        manager: &mut DatabaseConditionsManager,
        _key: &str,
    ) -> ConditionsResult<Self::Output> {
        let include_bad_channels = self.include_bad_channels;
        manager.with_connection(|manager| {
            let channels = manager.get_collection::<SvtChannel>()?;
            let mut conditions = SvtConditions {
                channels: channels
                    .iter()
                    .map(|channel| {
                        (
                            channel.channel_id,
                            SvtChannelConstants {
                                channel: channel.clone(),
                                gain: None,
                                offset: None,
                                bad: false,
                            },
                        )
                    })
                    .collect(),
            };
            if let Some(gains) = optional_collection::<SvtGain>(manager)? {
                for gain in gains.iter() {
                    if let Some(constants) = conditions.channels.get_mut(&gain.channel_id) {
                        constants.gain = Some(gain.gain);
                        constants.offset = Some(gain.offset);
                    }
                }
            }
            if include_bad_channels {
                if let Some(bad_channels) = optional_collection::<SvtBadChannel>(manager)? {
                    for bad in bad_channels.iter() {
                        if let Some(constants) = conditions.channels.get_mut(&bad.channel_id) {
                            constants.bad = true;
                        }
                    }
                }
            }
            debug!("built SVT conditions for {} channels", conditions.len());
            Ok(conditions)
        })
    }
}
