use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::accounts::{record_submission, AccountStore, ClientError};
use crate::mask_username;
use crate::models::TicketClassifier;
use crate::readings::{structs::ReadingRequest, PolicyEngine, ReadingsError};

pub mod events;

use events::*;

pub const DOMAIN: &str = "pik_comfort";
pub const SERVICE_PUSH_READINGS: &str = "push_readings";
pub const SERVICE_CREATE_TICKET: &str = "create_ticket";
pub const SERVICE_SEARCH_TICKET_CLASSIFIERS: &str = "search_ticket_classifiers";

pub const MAX_RESULTS_LIMIT: u32 = 100;

lazy_static! {
    static ref UUID_MATCH: Regex = Regex::new(r"^[a-f0-9]{8}-([a-f0-9]{4}-){3}[a-f0-9]{12}$").unwrap();
    static ref HTML_MATCH: Regex = Regex::new(r"(?i)<[a-z/!][^>]*>").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error(transparent)]
    Readings(#[from] ReadingsError),
    #[error("Invalid service data: {0}")]
    Validation(String),
    #[error("Account with id \"{0}\" not found")]
    AccountNotFound(String),
    #[error("API error: {0}")]
    Client(#[from] ClientError),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(target) => Ok(vec![target]),
        OneOrMany::Many(targets) => Ok(targets),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PushReadingsCall {
    /// Meter entities, object ids or meter uids
    #[serde(deserialize_with = "one_or_many")]
    pub entity_id: Vec<String>,
    #[serde(flatten)]
    pub request: ReadingRequest,
    /// Falls back to the configured default when omitted
    #[serde(default)]
    #[schema(value_type = Object)]
    pub notification: Option<NotificationOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CreateTicketCall {
    pub account_id: String,
    pub classifier_id: String,
    pub message: String,
    #[serde(default)]
    pub ignore_classifier_check: bool,
}

fn search_notification_default() -> NotificationOption { NotificationOption::Enabled(true) }
fn search_max_results_default() -> u32 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct SearchClassifiersCall {
    pub query: String,
    #[serde(default="search_notification_default")]
    #[schema(value_type = Object)]
    pub notification: NotificationOption,
    #[serde(default="search_max_results_default")]
    pub max_results: u32,
    #[serde(default)]
    pub force_update: bool,
}

fn check_uuid(field: &str, value: &str) -> Result<String, ServiceError> {
    let value = value.trim().to_lowercase();
    if !UUID_MATCH.is_match(&value) {
        return Err(ServiceError::Validation(format!("{field} must be a UUID, got \"{value}\"")));
    }
    Ok(value)
}

fn check_text(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{field} must not be empty")));
    }
    if HTML_MATCH.is_match(value) {
        return Err(ServiceError::Validation(format!("{field} must not contain HTML")));
    }
    Ok(())
}

/// Leaf classifiers whose name contains `query`, in catalogue order
pub fn search_classifiers<'a>(classifiers: &'a [TicketClassifier], query: &str, max_results: usize) -> Vec<&'a TicketClassifier> {
    let query = query.trim().to_lowercase();
    classifiers
        .iter()
        .filter(|c| !c.has_children && c.name.to_lowercase().contains(&query))
        .take(max_results)
        .collect()
}

/// Chain of classifiers from the root down to `classifier`
pub fn classifier_path<'a>(classifiers: &'a [TicketClassifier], classifier: &'a TicketClassifier) -> Vec<&'a TicketClassifier> {
    let mut path = vec![classifier];
    let mut current = classifier;
    while let Some(parent_id) = &current.parent_id {
        if path.len() > classifiers.len() {
            warn!("Classifier {} has a cyclic parent chain", classifier.id);
            break;
        }
        match classifiers.iter().find(|c| &c.id == parent_id) {
            Some(parent) => {
                path.push(parent);
                current = parent;
            },
            None => break,
        }
    }
    path.reverse();
    return path;
}

pub fn format_search_message(classifiers: &[TicketClassifier], query: &str, results: &[&TicketClassifier]) -> String {
    let results_text = if results.is_empty() {
        "_No results_".to_string()
    } else {
        results
            .iter()
            .map(|c| {
                let path = classifier_path(classifiers, c)
                    .iter()
                    .map(|p| escape_markdown(&p.name))
                    .collect::<Vec<String>>()
                    .join("_ > _");
                format!("- `{}`\n  _{}_", c.id, path)
            })
            .collect::<Vec<String>>()
            .join("\n")
    };

    return format!("Found classifiers for query _\"{}\"_:\n{}", escape_markdown(query), results_text);
}

/// Runs the integration's service actions against the account store
pub struct ServiceHandler {
    store: Arc<AccountStore>,
    engine: PolicyEngine,
    instance_name: String,
    phone_number: String,
    default_notification: bool,
}

impl ServiceHandler {
    pub fn new(store: Arc<AccountStore>, engine: PolicyEngine, instance_name: &str, phone_number: &str) -> Self {
        return ServiceHandler {
            store,
            engine,
            instance_name: instance_name.to_string(),
            phone_number: phone_number.to_string(),
            default_notification: false,
        };
    }

    pub fn with_default_notification(mut self, enabled: bool) -> Self {
        self.default_notification = enabled;
        return self;
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        return &self.store;
    }

    fn log_prefix(&self) -> String {
        return format!("[{}] ", mask_username(&self.phone_number));
    }

    /// One entry per target: an event, or the validation error that kept the target from firing one
    pub fn push_readings(&self, call: &PushReadingsCall, today: NaiveDate) -> Vec<Result<ServiceEvent, ServiceError>> {
        let mut outcomes = Vec::new();
        let notification = call.notification.clone().unwrap_or(NotificationOption::Enabled(self.default_notification));

        for target in call.entity_id.iter() {
            debug!("[{target}] Start handling readings submission");
            let outcome = self.store.with_meter_mut(target, |meter| -> Result<PushReadingsEvent, ReadingsError> {
                if meter.is_auto {
                    return Ok(PushReadingsEvent::declined(meter, call, "Meter submits readings automatically"));
                }

                let result = self.engine.evaluate(&meter.entity_id(), meter, &call.request, today)?;
                let mut event = PushReadingsEvent::from_result(result, call);
                if !event.success {
                    return Ok(event);
                }

                let readings = event.readings.clone().unwrap_or_default();
                match self.store.client().submit_readings(meter, &readings) {
                    Ok(receipt) => {
                        record_submission(meter, &receipt);
                        event.comment = Some(if receipt.confirmed {
                            "Readings submitted successfully".to_string()
                        } else {
                            "Readings queued for submission".to_string()
                        });
                    },
                    Err(e) => {
                        error!("[{target}] API error: {e}");
                        event.success = false;
                        event.comment = Some(format!("API error: {e}"));
                    },
                }
                Ok(event)
            });

            let outcome = match outcome {
                Some(Ok(event)) => Ok(event),
                Some(Err(e)) => {
                    warn!("[{target}] Readings rejected: {e}");
                    Err(ServiceError::Readings(e))
                },
                None => {
                    warn!("[{target}] Meter is unavailable");
                    Ok(PushReadingsEvent::unavailable(target, call, "Meter is unavailable"))
                },
            };

            outcomes.push(outcome.map(|event| {
                let meter_number = event.meter_number.clone().unwrap_or_else(|| "<unavailable>".to_string());
                let message = event.comment.clone().unwrap_or_else(|| "Response comment not provided".to_string());
                let mut service_event = ServiceEvent::new(SERVICE_PUSH_READINGS, EventData::PushReadings(event));
                service_event.notification = build_notification(
                    &notification,
                    format!("Readings submission - №{meter_number}"),
                    format!("{DOMAIN}_{SERVICE_PUSH_READINGS}_{meter_number}"),
                    message,
                    &service_event.data_json(),
                );
                info!("[{target}] End handling readings submission");
                service_event
            }));
        }

        return outcomes;
    }

    pub fn create_ticket(&self, call: &CreateTicketCall) -> Result<ServiceEvent, ServiceError> {
        let account_id = check_uuid("account_id", &call.account_id)?;
        let classifier_id = check_uuid("classifier_id", &call.classifier_id)?;
        check_text("message", &call.message)?;

        let account = self.store.account(&account_id).ok_or_else(|| {
            error!("Account with id \"{account_id}\" not found");
            ServiceError::AccountNotFound(account_id.clone())
        })?;

        let mut event = CreateTicketEvent::pending(call);
        event.account_id = account_id.clone();
        event.classifier_id = classifier_id.clone();

        info!("{}Creating a new ticket", self.log_prefix());

        if !call.ignore_classifier_check {
            if let Err(comment) = self.check_classifier(&classifier_id) {
                warn!("{}{comment}", self.log_prefix());
                event.comment = Some(comment);
                return Ok(ServiceEvent::new(SERVICE_CREATE_TICKET, EventData::CreateTicket(event)));
            }
        }

        match self.store.client().create_ticket(&account, &classifier_id, &call.message) {
            Ok(ticket) => {
                event.ticket_id = Some(ticket.id.clone());
                event.success = true;
                event.comment = Some("Ticket created successfully".to_string());
                self.store.add_ticket(&account.id, ticket);
                info!("{}Ticket created successfully", self.log_prefix());
            },
            Err(e) => {
                error!("{}API error: {e}", self.log_prefix());
                event.comment = Some(format!("API error: {e}"));
            },
        }

        Ok(ServiceEvent::new(SERVICE_CREATE_TICKET, EventData::CreateTicket(event)))
    }

    fn check_classifier(&self, classifier_id: &str) -> Result<(), String> {
        if self.store.classifiers().is_empty() {
            self.store.refresh_classifiers().map_err(|e| format!("API error: {e}"))?;
        }

        match self.store.classifiers().iter().find(|c| c.id.eq_ignore_ascii_case(classifier_id)) {
            None => Err(format!("Classifier \"{classifier_id}\" not found")),
            Some(c) if c.has_children => Err(format!("Classifier \"{classifier_id}\" is a category, pick one of its entries")),
            Some(_) => Ok(()),
        }
    }

    pub fn search_ticket_classifiers(&self, call: &SearchClassifiersCall) -> Result<ServiceEvent, ServiceError> {
        check_text("query", &call.query)?;
        if call.max_results < 1 || call.max_results > MAX_RESULTS_LIMIT {
            return Err(ServiceError::Validation(format!("max_results must be within 1..{MAX_RESULTS_LIMIT}, got {}", call.max_results)));
        }

        if call.force_update || self.store.classifiers().is_empty() {
            self.store.refresh_classifiers()?;
        }

        let query = call.query.trim().to_lowercase();
        debug!("{}Searching classifiers for \"{query}\"", self.log_prefix());

        let classifiers = self.store.classifiers();
        let results = search_classifiers(&classifiers, &query, call.max_results as usize);
        let message = format_search_message(&classifiers, &query, &results);
        info!("{}{message}", self.log_prefix());

        let event = SearchClassifiersEvent {
            instance: self.instance_name.clone(),
            phone_number: mask_username(&self.phone_number),
            results: results.iter().map(|c| (c.id.clone(), c.name.clone())).collect::<BTreeMap<String, String>>(),
            count: results.len(),
            message: message.clone(),
        };

        let mut service_event = ServiceEvent::new(SERVICE_SEARCH_TICKET_CLASSIFIERS, EventData::SearchClassifiers(event));
        service_event.notification = build_notification(
            &call.notification,
            "Ticket classifier search results".to_string(),
            format!("{DOMAIN}_{SERVICE_SEARCH_TICKET_CLASSIFIERS}"),
            message,
            &service_event.data_json(),
        );
        Ok(service_event)
    }
}
