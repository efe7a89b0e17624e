use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use thiserror::Error;
use crate::models::{Meter, TariffZone, Zone};

pub mod parser;
pub mod structs;

use structs::*;

/// Malformed readings, raised before any policy check
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadingsError {
    #[error("No readings provided")]
    NoValues,
    #[error("{given} readings provided but the meter has {zones} tariff zone(s)")]
    TooManyValues { given: usize, zones: usize },
    #[error("Reading {0:?} is not a number")]
    NotNumeric(String),
    #[error("Reading for {zone} is negative: {value}")]
    Negative { zone: Zone, value: f64 },
    #[error("Reading for {0} is not a finite number")]
    NotFinite(Zone),
    #[error("{0:?} is not a tariff zone")]
    UnknownZone(String),
    #[error("Meter zone {0} does not exist")]
    ZoneNotOnMeter(Zone),
    #[error("Reading for {0} is given more than once")]
    DuplicateZone(Zone),
}

/// Decides whether a reading submission is allowed and what gets submitted.
/// Evaluation is a pure function of meter snapshot, request and date.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine {
    incremental_base: IncrementalBase,
}

impl PolicyEngine {
    pub fn new(incremental_base: IncrementalBase) -> Self {
        return PolicyEngine { incremental_base };
    }

    pub fn evaluate(&self, entity_id: &str, meter: &Meter, request: &ReadingRequest, today: NaiveDate) -> Result<SubmissionResult, ReadingsError> {
        let requested = parser::parse_readings(&request.readings, meter.zone_count())?;
        for zone in requested.keys() {
            if meter.tariff(*zone).is_none() {
                return Err(ReadingsError::ZoneNotOnMeter(*zone));
            }
        }

        let mut result = SubmissionResult {
            entity_id: entity_id.to_string(),
            meter: MeterIdentity::of(meter),
            success: false,
            comment: String::new(),
            readings: None,
            rejection: None,
            call_params: request.clone(),
        };

        if !request.ignore_periods {
            let day = today.day();
            let window = meter.window;
            if !window.contains(day) {
                info!("Meter {}: day {} is outside of submission window {}..{}", meter.uid, day, window.start_day, window.end_day);
                result.comment = format!(
                    "Readings are accepted from day {} to day {} of the month, today is day {}",
                    window.start_day, window.end_day, day
                );
                result.rejection = Some(Rejection::Period { day, start_day: window.start_day, end_day: window.end_day });
                return Ok(result);
            }
        }

        let computed = self.compute(meter, &requested, request.incremental)?;
        debug!("Meter {}: computed readings {:?} (incremental: {})", meter.uid, computed, request.incremental);

        if !request.ignore_readings {
            let violations = monotonicity_violations(meter, &computed);
            if !violations.is_empty() {
                info!("Meter {}: {} zone(s) below recorded values", meter.uid, violations.len());
                result.comment = violations
                    .iter()
                    .map(|v| format!("Reading for {} ({}) is lower than the recorded value ({})", v.zone, v.attempted, v.floor))
                    .collect::<Vec<String>>()
                    .join("; ");
                result.readings = Some(computed);
                result.rejection = Some(Rejection::Monotonicity { violations });
                return Ok(result);
            }
        }

        result.success = true;
        result.comment = "Readings accepted for submission".to_string();
        result.readings = Some(computed);
        Ok(result)
    }

    fn compute(&self, meter: &Meter, requested: &ZoneReadings, incremental: bool) -> Result<ZoneReadings, ReadingsError> {
        let mut computed = ZoneReadings::new();
        for (zone, value) in requested.iter() {
            let mut effective = *value;
            if incremental {
                if let Some(tariff) = meter.tariff(*zone) {
                    effective += self.base_value(tariff);
                }
            }
            if !effective.is_finite() {
                return Err(ReadingsError::NotFinite(*zone));
            }
            computed.insert(*zone, effective);
        }
        Ok(computed)
    }

    fn base_value(&self, tariff: &TariffZone) -> f64 {
        match self.incremental_base {
            IncrementalBase::Known => tariff.value,
            IncrementalBase::Last => tariff.last_value.unwrap_or(0.0),
            IncrementalBase::Accepted => tariff.accepted_value.unwrap_or(0.0),
            IncrementalBase::Max => tariff.floor(),
        }
    }
}

fn monotonicity_violations(meter: &Meter, computed: &ZoneReadings) -> Vec<ZoneViolation> {
    let mut violations = Vec::new();
    for (zone, attempted) in computed.iter() {
        if let Some(tariff) = meter.tariff(*zone) {
            let floor = tariff.floor();
            if *attempted < floor {
                violations.push(ZoneViolation { zone: *zone, attempted: *attempted, floor });
            }
        }
    }
    return violations;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubmissionWindow, TariffZone};
    use serde_json::json;

    fn meter(known: [f64; 3]) -> Meter {
        let mut m = Meter::new("m-1", vec![
            TariffZone::new(Zone::T1, known[0]),
            TariffZone::new(Zone::T2, known[1]),
            TariffZone::new(Zone::T3, known[2]),
        ]);
        m.code = Some("12345".to_string());
        m.window = SubmissionWindow::new(15, 25);
        m
    }

    fn request(readings: serde_json::Value) -> ReadingRequest {
        ReadingRequest::new(serde_json::from_value(readings).unwrap())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_rejected_outside_window() {
        let engine = PolicyEngine::default();
        let r = engine.evaluate("binary_sensor.x", &meter([0.0; 3]), &request(json!([123, 456, 789])), day(11)).unwrap();
        assert!(!r.success);
        assert!(r.readings.is_none());
        assert_eq!(r.rejection, Some(Rejection::Period { day: 11, start_day: 15, end_day: 25 }));
        assert_eq!(r.meter.meter_code.as_deref(), Some("12345"));
        assert_eq!(r.entity_id, "binary_sensor.x");
    }

    #[test]
    fn test_forced_submission_outside_window() {
        let engine = PolicyEngine::default();
        let mut req = request(json!([123, 456, 789]));
        req.ignore_readings = true;
        req.ignore_periods = true;
        let r = engine.evaluate("e", &meter([1000.0; 3]), &req, day(11)).unwrap();
        assert!(r.success);
        let readings = r.readings.unwrap();
        assert_eq!(readings[&Zone::T1], 123.0);
        assert_eq!(readings[&Zone::T2], 456.0);
        assert_eq!(readings[&Zone::T3], 789.0);
    }

    #[test]
    fn test_incremental_within_window() {
        let engine = PolicyEngine::default();
        let mut req = request(json!([123, 456, 789]));
        req.incremental = true;
        let r = engine.evaluate("e", &meter([321.0, 654.0, 987.0]), &req, day(20)).unwrap();
        assert!(r.success);
        let readings = r.readings.unwrap();
        assert_eq!(readings.values().copied().collect::<Vec<f64>>(), vec![444.0, 1110.0, 1776.0]);
    }

    #[test]
    fn test_incremental_outside_window() {
        let engine = PolicyEngine::default();
        let mut req = request(json!([123, 456, 789]));
        req.incremental = true;
        let r = engine.evaluate("e", &meter([321.0, 654.0, 987.0]), &req, day(11)).unwrap();
        assert!(!r.success);
        assert!(r.readings.is_none());
    }

    #[test]
    fn test_monotonicity_keeps_attempted_values() {
        let engine = PolicyEngine::default();
        let mut m = meter([100.0, 200.0, 300.0]);
        m.tariffs[1].accepted_value = Some(250.0);
        let r = engine.evaluate("e", &m, &request(json!("150, 220")), day(16)).unwrap();
        assert!(!r.success);
        assert!(r.comment.contains("T2"));
        assert_eq!(r.readings.as_ref().unwrap()[&Zone::T2], 220.0);
        match r.rejection {
            Some(Rejection::Monotonicity { violations }) => {
                assert_eq!(violations, vec![ZoneViolation { zone: Zone::T2, attempted: 220.0, floor: 250.0 }]);
            },
            other => panic!("unexpected rejection {other:?}"),
        }
    }

    #[test]
    fn test_equal_value_passes_monotonicity() {
        let engine = PolicyEngine::default();
        let r = engine.evaluate("e", &meter([100.0, 200.0, 300.0]), &request(json!([100])), day(15)).unwrap();
        assert!(r.success);
        assert_eq!(r.readings.unwrap().len(), 1);
    }

    #[test]
    fn test_forced_submission_still_sums() {
        let engine = PolicyEngine::default();
        let mut req = request(json!({"t1": 5}));
        req.incremental = true;
        req.ignore_readings = true;
        req.ignore_periods = true;
        let r = engine.evaluate("e", &meter([10.0, 0.0, 0.0]), &req, day(1)).unwrap();
        assert_eq!(r.readings.unwrap()[&Zone::T1], 15.0);
    }

    #[test]
    fn test_incremental_base_setting() {
        let mut m = meter([100.0, 0.0, 0.0]);
        m.tariffs[0].last_value = Some(130.0);
        m.tariffs[0].accepted_value = Some(120.0);
        let mut req = request(json!([1]));
        req.incremental = true;
        req.ignore_periods = true;

        let expect = [
            (IncrementalBase::Known, 101.0),
            (IncrementalBase::Last, 131.0),
            (IncrementalBase::Accepted, 121.0),
            (IncrementalBase::Max, 131.0),
        ];
        for (base, value) in expect {
            let r = PolicyEngine::new(base).evaluate("e", &m, &req, day(1)).unwrap();
            assert_eq!(r.readings.as_ref().unwrap()[&Zone::T1], value, "{base:?}");
        }
    }

    #[test]
    fn test_validation_before_policy() {
        let engine = PolicyEngine::default();
        let mut m = meter([0.0; 3]);
        m.tariffs.truncate(2);
        assert_eq!(
            engine.evaluate("e", &m, &request(json!([1, 2, 3])), day(11)).unwrap_err(),
            ReadingsError::TooManyValues { given: 3, zones: 2 }
        );
        assert_eq!(
            engine.evaluate("e", &m, &request(json!({"t3": 1})), day(20)).unwrap_err(),
            ReadingsError::ZoneNotOnMeter(Zone::T3)
        );
    }

    #[test]
    fn test_incremental_sum_must_stay_finite() {
        let engine = PolicyEngine::default();
        let mut req = request(json!([1e308]));
        req.incremental = true;
        req.ignore_periods = true;
        req.ignore_readings = true;
        assert_eq!(
            engine.evaluate("e", &meter([1e308, 0.0, 0.0]), &req, day(1)).unwrap_err(),
            ReadingsError::NotFinite(Zone::T1)
        );

        req.incremental = false;
        assert!(engine.evaluate("e", &meter([1e308, 0.0, 0.0]), &req, day(1)).unwrap().success);
    }

    #[test]
    fn test_evaluation_is_repeatable() {
        let engine = PolicyEngine::new(IncrementalBase::Max);
        let m = meter([5.0, 6.0, 7.0]);
        let mut req = request(json!("1 2 3"));
        req.incremental = true;
        let first = engine.evaluate("e", &m, &req, day(18)).unwrap();
        let second = engine.evaluate("e", &m, &req, day(18)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ignored_checks_are_pass_through() {
        let engine = PolicyEngine::default();
        let m = meter([50.0, 60.0, 70.0]);
        for d in [1, 11, 20, 31] {
            for incremental in [false, true] {
                let mut req = request(json!([1, 2, 3]));
                req.incremental = incremental;
                req.ignore_periods = true;
                req.ignore_readings = true;
                let r = engine.evaluate("e", &m, &req, NaiveDate::from_ymd_opt(2024, 1, d).unwrap()).unwrap();
                assert!(r.success);
                let readings = r.readings.unwrap();
                for (i, zone) in Zone::ALL.iter().enumerate() {
                    let base = if incremental { m.tariffs[i].value } else { 0.0 };
                    assert_eq!(readings[zone], (i as f64 + 1.0) + base);
                }
            }
        }
    }

    #[test]
    fn test_result_serializes_identity() {
        let engine = PolicyEngine::default();
        let r = engine.evaluate("binary_sensor.m", &meter([0.0; 3]), &request(json!("1")), day(20)).unwrap();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["meter_uid"], "m-1");
        assert_eq!(v["readings"]["T1"], 1.0);
        assert_eq!(v["call_params"]["readings"], "1");
    }
}
