use std::collections::BTreeMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Meter;
use crate::readings::structs::{MeterIdentity, Rejection, SubmissionResult, ZoneReadings};
use super::{CreateTicketCall, PushReadingsCall, DOMAIN};

pub const NOTIFICATION_TOPIC: &str = "pik_comfort/notification";

lazy_static! {
    static ref MARKDOWN_PARSE: Regex = Regex::new(r"([_*\[\]()~`>#+\-=|.!])").unwrap();
    static ref MARKDOWN_REPARSE: Regex = Regex::new(r"\\\\([_*\[\]()~`>#+\-=|.!])").unwrap();
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap();
}

pub fn escape_markdown(text: &str) -> String {
    let parsed = MARKDOWN_PARSE.replace_all(text, r"\$1");
    return MARKDOWN_REPARSE.replace_all(&parsed, "$1").to_string();
}

/// `false` disables the notification, `true` sends the default one and a
/// mapping overrides notification fields with `{placeholder}` templates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NotificationOption {
    Enabled(bool),
    Custom(BTreeMap<String, String>),
}

impl Default for NotificationOption {
    fn default() -> Self {
        NotificationOption::Enabled(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub notification_id: String,
    pub message: String,
}

/// Replaces `{key}` with the matching top level field of `data`, unknown keys stay as they are
pub fn format_template(template: &str, data: &serde_json::Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            match data.get(&caps[1]) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) => "".to_string(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

pub fn build_notification(option: &NotificationOption, title: String, notification_id: String, message: String, data: &serde_json::Value) -> Option<Notification> {
    let mut notification = Notification { title, notification_id, message };
    match option {
        NotificationOption::Enabled(false) => return None,
        NotificationOption::Enabled(true) => {},
        NotificationOption::Custom(fields) => {
            for (key, template) in fields.iter() {
                let value = format_template(template, data);
                match key.as_str() {
                    "title" => notification.title = value,
                    "notification_id" => notification.notification_id = value,
                    "message" => notification.message = value,
                    _ => {},
                }
            }
        },
    }
    return Some(notification);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushReadingsEvent {
    pub entity_id: String,
    pub meter_id: Option<String>,
    pub meter_type: Option<String>,
    pub meter_number: Option<String>,
    pub call_params: PushReadingsCall,
    pub success: bool,
    pub comment: Option<String>,
    pub readings: Option<ZoneReadings>,
    pub rejection: Option<Rejection>,
}

impl PushReadingsEvent {
    pub fn from_result(result: SubmissionResult, call: &PushReadingsCall) -> Self {
        return PushReadingsEvent {
            entity_id: result.entity_id,
            meter_id: Some(result.meter.meter_uid),
            meter_type: Some(result.meter.meter_type),
            meter_number: result.meter.meter_code,
            call_params: call.clone(),
            success: result.success,
            comment: Some(result.comment),
            readings: result.readings,
            rejection: result.rejection,
        };
    }

    /// The meter exists but does not take readings from this service
    pub fn declined(meter: &Meter, call: &PushReadingsCall, comment: &str) -> Self {
        let identity = MeterIdentity::of(meter);
        return PushReadingsEvent {
            entity_id: meter.entity_id(),
            meter_id: Some(identity.meter_uid),
            meter_type: Some(identity.meter_type),
            meter_number: identity.meter_code,
            call_params: call.clone(),
            success: false,
            comment: Some(comment.to_string()),
            readings: None,
            rejection: None,
        };
    }

    pub fn unavailable(target: &str, call: &PushReadingsCall, comment: &str) -> Self {
        return PushReadingsEvent {
            entity_id: target.to_string(),
            meter_id: None,
            meter_type: None,
            meter_number: None,
            call_params: call.clone(),
            success: false,
            comment: Some(comment.to_string()),
            readings: None,
            rejection: None,
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTicketEvent {
    pub account_id: String,
    pub classifier_id: String,
    pub message: String,
    pub ignore_classifier_check: bool,
    pub ticket_id: Option<String>,
    pub success: bool,
    pub comment: Option<String>,
}

impl CreateTicketEvent {
    pub fn pending(call: &CreateTicketCall) -> Self {
        return CreateTicketEvent {
            account_id: call.account_id.clone(),
            classifier_id: call.classifier_id.clone(),
            message: call.message.clone(),
            ignore_classifier_check: call.ignore_classifier_check,
            ticket_id: None,
            success: false,
            comment: None,
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchClassifiersEvent {
    pub instance: String,
    pub phone_number: String,
    pub results: BTreeMap<String, String>,
    pub count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventData {
    PushReadings(PushReadingsEvent),
    CreateTicket(CreateTicketEvent),
    SearchClassifiers(SearchClassifiersEvent),
}

/// One event fired by a service call, published on `pik_comfort/event/<service>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEvent {
    pub event_type: String,
    pub data: EventData,
    pub notification: Option<Notification>,
}

impl ServiceEvent {
    pub fn new(service: &str, data: EventData) -> Self {
        return ServiceEvent {
            event_type: format!("{DOMAIN}_{service}"),
            data,
            notification: None,
        };
    }

    pub fn topic(&self) -> String {
        return format!("{DOMAIN}/event/{}", self.event_type);
    }

    pub fn data_json(&self) -> serde_json::Value {
        return serde_json::to_value(&self.data).unwrap_or_default();
    }

    pub fn success(&self) -> bool {
        match &self.data {
            EventData::PushReadings(e) => e.success,
            EventData::CreateTicket(e) => e.success,
            EventData::SearchClassifiers(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("Hot water (leak)"), r"Hot water \(leak\)");
        assert_eq!(escape_markdown("a_b.c"), r"a\_b\.c");
        assert_eq!(escape_markdown("plain"), "plain");
    }

    #[test]
    fn test_format_template() {
        let data = json!({"meter_number": "123", "success": true, "comment": null});
        assert_eq!(format_template("Meter {meter_number}: {success}", &data), "Meter 123: true");
        assert_eq!(format_template("{comment}|{missing}", &data), "|{missing}");
    }

    #[test]
    fn test_build_notification() {
        let data = json!({"meter_number": "77"});
        assert!(build_notification(&NotificationOption::Enabled(false), "t".into(), "id".into(), "m".into(), &data).is_none());

        let n = build_notification(&NotificationOption::Enabled(true), "t".into(), "id".into(), "m".into(), &data).unwrap();
        assert_eq!(n.message, "m");

        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "Meter {meter_number}".to_string());
        let n = build_notification(&NotificationOption::Custom(fields), "t".into(), "id".into(), "m".into(), &data).unwrap();
        assert_eq!(n.title, "Meter 77");
        assert_eq!(n.notification_id, "id");
    }

    #[test]
    fn test_notification_option_parsing() {
        let o: NotificationOption = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(o, NotificationOption::Enabled(true));
        let o: NotificationOption = serde_json::from_value(json!({"title": "x"})).unwrap();
        assert!(matches!(o, NotificationOption::Custom(_)));
        assert_eq!(NotificationOption::default(), NotificationOption::Enabled(false));
    }
}
