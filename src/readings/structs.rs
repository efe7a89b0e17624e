use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use crate::models::{Meter, Zone};

/// Final value per zone, ordered T1..T3
pub type ZoneReadings = BTreeMap<Zone, f64>;

/// Which recorded value an incremental reading is added to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalBase {
    #[default]
    Known,
    Last,
    Accepted,
    Max,
}

/// Readings as sent by a caller: `"123, 456"`, `[123, 456]`, `{"t1": 123}` or a bare number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReadingsInput {
    Number(f64),
    Text(String),
    List(Vec<serde_json::Value>),
    Mapping(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ReadingRequest {
    #[schema(value_type = Object)]
    pub readings: ReadingsInput,
    #[serde(default)]
    pub incremental: bool,
    /// Skip the check against previously recorded values
    #[serde(default, alias = "ignore_indications")]
    pub ignore_readings: bool,
    /// Skip the check against the submission window
    #[serde(default)]
    pub ignore_periods: bool,
}

impl ReadingRequest {
    pub fn new(readings: ReadingsInput) -> Self {
        return ReadingRequest {
            readings,
            incremental: false,
            ignore_readings: false,
            ignore_periods: false,
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneViolation {
    pub zone: Zone,
    pub attempted: f64,
    pub floor: f64,
}

/// Why a well formed request was not accepted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    Period { day: u32, start_day: u32, end_day: u32 },
    Monotonicity { violations: Vec<ZoneViolation> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterIdentity {
    pub meter_uid: String,
    pub meter_type: String,
    pub meter_code: Option<String>,
}

impl MeterIdentity {
    pub fn of(meter: &Meter) -> Self {
        return MeterIdentity {
            meter_uid: meter.uid.clone(),
            meter_type: meter.meter_type.clone(),
            meter_code: meter.code.clone(),
        };
    }
}

/// Outcome of one policy evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionResult {
    pub entity_id: String,
    #[serde(flatten)]
    pub meter: MeterIdentity,
    pub success: bool,
    pub comment: String,
    /// `None` when the request was rejected before values were computed
    pub readings: Option<ZoneReadings>,
    pub rejection: Option<Rejection>,
    pub call_params: ReadingRequest,
}
