use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use crate::models::Zone;
use super::{ReadingsError, structs::{ReadingsInput, ZoneReadings}};

lazy_static! {
    static ref SEPARATORS: Regex = Regex::new(r"[,;\s]+").unwrap();
}

/// Normalises any accepted input shape into a zone indexed map.
/// `zone_count` is the number of tariff zones of the target meter.
pub fn parse_readings(input: &ReadingsInput, zone_count: usize) -> Result<ZoneReadings, ReadingsError> {
    let mut readings = ZoneReadings::new();

    match input {
        ReadingsInput::Number(value) => {
            check_count(1, zone_count)?;
            readings.insert(Zone::T1, checked_value(Zone::T1, *value)?);
        },
        ReadingsInput::Text(text) => {
            let tokens: Vec<&str> = SEPARATORS.split(text.trim()).filter(|t| !t.is_empty()).collect();
            check_count(tokens.len(), zone_count)?;
            for (position, token) in tokens.iter().enumerate() {
                let zone = positional_zone(position, tokens.len(), zone_count)?;
                let value = token.parse::<f64>().map_err(|_| ReadingsError::NotNumeric(token.to_string()))?;
                readings.insert(zone, checked_value(zone, value)?);
            }
        },
        ReadingsInput::List(values) => {
            check_count(values.len(), zone_count)?;
            for (position, value) in values.iter().enumerate() {
                let zone = positional_zone(position, values.len(), zone_count)?;
                readings.insert(zone, checked_value(zone, json_number(value)?)?);
            }
        },
        ReadingsInput::Mapping(map) => {
            check_count(map.len(), zone_count)?;
            for (key, value) in map.iter() {
                let zone = Zone::from_str(key).ok_or_else(|| ReadingsError::UnknownZone(key.clone()))?;
                if readings.contains_key(&zone) {
                    return Err(ReadingsError::DuplicateZone(zone));
                }
                readings.insert(zone, checked_value(zone, json_number(value)?)?);
            }
        },
    }

    if readings.is_empty() {
        return Err(ReadingsError::NoValues);
    }

    debug!("Parsed readings {readings:?}");
    Ok(readings)
}

fn check_count(given: usize, zones: usize) -> Result<(), ReadingsError> {
    if given > zones {
        return Err(ReadingsError::TooManyValues { given, zones });
    }
    Ok(())
}

fn positional_zone(position: usize, given: usize, zones: usize) -> Result<Zone, ReadingsError> {
    Zone::from_position(position).ok_or(ReadingsError::TooManyValues { given, zones })
}

/// Numbers are taken as is, strings are parsed like in the text form
fn json_number(value: &serde_json::Value) -> Result<f64, ReadingsError> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| ReadingsError::NotNumeric(n.to_string())),
        serde_json::Value::String(s) => s.trim().parse::<f64>().map_err(|_| ReadingsError::NotNumeric(s.clone())),
        other => Err(ReadingsError::NotNumeric(other.to_string())),
    }
}

fn checked_value(zone: Zone, value: f64) -> Result<f64, ReadingsError> {
    if !value.is_finite() {
        return Err(ReadingsError::NotFinite(zone));
    }
    if value < 0.0 {
        return Err(ReadingsError::Negative { zone, value });
    }
    /* -0 compares equal to 0 but must not be sent with its sign */
    if value == 0.0 {
        return Ok(0.0);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(v: serde_json::Value) -> ReadingsInput {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_parse_text() {
        let r = parse_readings(&input(json!("123, 456 789")), 3).unwrap();
        assert_eq!(r.get(&Zone::T1), Some(&123.0));
        assert_eq!(r.get(&Zone::T2), Some(&456.0));
        assert_eq!(r.get(&Zone::T3), Some(&789.0));
    }

    #[test]
    fn test_parse_list_and_number() {
        let r = parse_readings(&input(json!([1.5, "2.5"])), 2).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.get(&Zone::T2), Some(&2.5));

        let r = parse_readings(&input(json!(42)), 1).unwrap();
        assert_eq!(r.get(&Zone::T1), Some(&42.0));
    }

    #[test]
    fn test_parse_mapping() {
        let r = parse_readings(&input(json!({"t2": 10, "T1": 5})), 3).unwrap();
        assert_eq!(r.keys().copied().collect::<Vec<_>>(), vec![Zone::T1, Zone::T2]);

        let e = parse_readings(&input(json!({"night": 10})), 3).unwrap_err();
        assert_eq!(e, ReadingsError::UnknownZone("night".to_string()));
    }

    #[test]
    fn test_mapping_rejects_same_zone_twice() {
        let e = parse_readings(&input(json!({"t1": 5, "T1": 7})), 3).unwrap_err();
        assert_eq!(e, ReadingsError::DuplicateZone(Zone::T1));
        let e = parse_readings(&input(json!({"1": 5, "t1": 7})), 3).unwrap_err();
        assert_eq!(e, ReadingsError::DuplicateZone(Zone::T1));
    }

    #[test]
    fn test_negative_zero_is_plain_zero() {
        let r = parse_readings(&input(json!("-0, 1")), 3).unwrap();
        assert!(r[&Zone::T1].is_sign_positive());
        let r = parse_readings(&input(json!([-0.0])), 3).unwrap();
        assert!(r[&Zone::T1].is_sign_positive());
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"T1":0.0}"#);
    }

    #[test]
    fn test_fewer_values_than_zones() {
        let r = parse_readings(&input(json!("100")), 3).unwrap();
        assert_eq!(r.len(), 1);
        assert!(r.get(&Zone::T2).is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_eq!(
            parse_readings(&input(json!("1,2,3")), 2).unwrap_err(),
            ReadingsError::TooManyValues { given: 3, zones: 2 }
        );
        assert_eq!(
            parse_readings(&input(json!("12,abc")), 3).unwrap_err(),
            ReadingsError::NotNumeric("abc".to_string())
        );
        assert_eq!(
            parse_readings(&input(json!([5, -1])), 3).unwrap_err(),
            ReadingsError::Negative { zone: Zone::T2, value: -1.0 }
        );
        assert!(matches!(
            parse_readings(&input(json!([true])), 3).unwrap_err(),
            ReadingsError::NotNumeric(_)
        ));
        assert_eq!(parse_readings(&input(json!(" , ")), 3).unwrap_err(), ReadingsError::NoValues);
        assert_eq!(parse_readings(&input(json!("inf")), 3).unwrap_err(), ReadingsError::NotFinite(Zone::T1));
    }
}
