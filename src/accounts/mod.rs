use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use uuid::Uuid;

use crate::models::{Account, Meter, Ticket, TicketClassifier, TicketStatus, Zone};
use crate::mqtt::{PublishData, Transmission};
use crate::readings::structs::ZoneReadings;

pub const OUTBOX_READINGS_TOPIC: &str = "pik_comfort/outbox/readings";
pub const OUTBOX_TICKETS_TOPIC: &str = "pik_comfort/outbox/tickets";
/// The transmitter answers here with the readings the account accepted
pub const OUTBOX_READINGS_ACK_TOPIC: &str = "pik_comfort/outbox/readings/ack";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Transmission failed: {0}")]
    Transmission(String),
    #[error("Transmission channel closed")]
    ChannelClosed,
}

/// One reading line as the account API expects it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmittedReading {
    pub value: f64,
    pub tariff_type: u8,
    pub meter: String,
    pub meter_reading_uid: String,
}

impl SubmittedReading {
    pub fn build(meter: &Meter, readings: &ZoneReadings) -> Vec<Self> {
        readings
            .iter()
            .map(|(zone, value)| SubmittedReading {
                value: *value,
                tariff_type: zone.tariff_type(),
                meter: meter.uid.clone(),
                meter_reading_uid: format!("{}{}", meter.uid, zone.tariff_type()),
            })
            .collect()
    }
}

/// What a client did with a readings submission. `confirmed` is only set
/// when the account itself answered, a queued hand-off leaves it false.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub readings: Vec<SubmittedReading>,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub ticket_id: String,
    pub account_id: String,
    pub classifier_id: String,
    pub message: String,
}

/// Talks to the personal account on behalf of the services. Implementations
/// own the network side; a returned `Ok` means the data left this process.
pub trait AccountClient: Send + Sync {
    fn submit_readings(&self, meter: &Meter, readings: &ZoneReadings) -> Result<SubmissionReceipt, ClientError>;
    fn create_ticket(&self, account: &Account, classifier_id: &str, message: &str) -> Result<Ticket, ClientError>;
    fn fetch_classifiers(&self) -> Result<Vec<TicketClassifier>, ClientError>;
}

/// Hands requests to an external transmitter through MQTT outbox topics.
/// Classifiers come from the configuration. Readings are never confirmed
/// here, the transmitter acknowledges them on `OUTBOX_READINGS_ACK_TOPIC`.
pub struct OutboxClient {
    sender: Sender<Transmission>,
    classifiers: Vec<TicketClassifier>,
}

impl OutboxClient {
    pub fn new(sender: Sender<Transmission>, classifiers: Vec<TicketClassifier>) -> Self {
        return OutboxClient { sender, classifiers };
    }

    fn publish(&self, topic: &str, payload: String) -> Result<(), ClientError> {
        let data = PublishData {
            topic: topic.to_string(),
            payload,
            qos: 1,
            retain: false,
        };

        match self.sender.try_send(Transmission::Publish(data)) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ClientError::Transmission("outbox is full".to_string())),
            Err(TrySendError::Closed(_)) => Err(ClientError::ChannelClosed),
        }
    }
}

impl AccountClient for OutboxClient {
    fn submit_readings(&self, meter: &Meter, readings: &ZoneReadings) -> Result<SubmissionReceipt, ClientError> {
        let submitted = SubmittedReading::build(meter, readings);
        let payload = serde_json::to_string(&submitted).map_err(|e| ClientError::Transmission(e.to_string()))?;
        self.publish(OUTBOX_READINGS_TOPIC, payload)?;
        info!("Readings for meter {} handed to the outbox", meter.uid);
        Ok(SubmissionReceipt { readings: submitted, confirmed: false })
    }

    fn create_ticket(&self, account: &Account, classifier_id: &str, message: &str) -> Result<Ticket, ClientError> {
        let request = TicketRequest {
            ticket_id: Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            classifier_id: classifier_id.to_string(),
            message: message.to_string(),
        };
        let payload = serde_json::to_string(&request).map_err(|e| ClientError::Transmission(e.to_string()))?;
        self.publish(OUTBOX_TICKETS_TOPIC, payload)?;

        Ok(Ticket {
            id: request.ticket_id,
            number: None,
            classifier_id: request.classifier_id,
            message: request.message,
            status: TicketStatus::Received,
            created: Utc::now(),
        })
    }

    fn fetch_classifiers(&self) -> Result<Vec<TicketClassifier>, ClientError> {
        Ok(self.classifiers.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the account snapshots. Every access goes through one lock, so
/// submissions against the same meter never overlap.
pub struct AccountStore {
    accounts: Mutex<Vec<Account>>,
    classifiers: Mutex<Vec<TicketClassifier>>,
    client: Arc<dyn AccountClient>,
}

impl AccountStore {
    pub fn new(accounts: Vec<Account>, client: Arc<dyn AccountClient>) -> Self {
        let meter_count: usize = accounts.iter().map(|a| a.meters.len()).sum();
        info!("Account store holds {} account(s) with {} meter(s)", accounts.len(), meter_count);
        return AccountStore {
            accounts: Mutex::new(accounts),
            classifiers: Mutex::new(Vec::new()),
            client,
        };
    }

    pub fn client(&self) -> &dyn AccountClient {
        return self.client.as_ref();
    }

    pub fn accounts(&self) -> Vec<Account> {
        return lock(&self.accounts).clone();
    }

    pub fn meters(&self) -> Vec<Meter> {
        let accounts = lock(&self.accounts);
        return accounts.iter().flat_map(|a| a.meters.iter().cloned()).collect();
    }

    pub fn account(&self, account_id: &str) -> Option<Account> {
        let accounts = lock(&self.accounts);
        accounts.iter().find(|a| a.id.eq_ignore_ascii_case(account_id)).cloned()
    }

    /// Runs `f` on the meter matching `target` while holding the store lock
    pub fn with_meter_mut<R>(&self, target: &str, f: impl FnOnce(&mut Meter) -> R) -> Option<R> {
        let mut accounts = lock(&self.accounts);
        let meter = accounts
            .iter_mut()
            .flat_map(|a| a.meters.iter_mut())
            .find(|m| m.matches_target(target))?;
        Some(f(meter))
    }

    pub fn add_ticket(&self, account_id: &str, ticket: Ticket) -> bool {
        let mut accounts = lock(&self.accounts);
        match accounts.iter_mut().find(|a| a.id.eq_ignore_ascii_case(account_id)) {
            Some(account) => {
                debug!("Adding ticket {} to account {}", ticket.id, account.id);
                account.tickets.push(ticket);
                true
            },
            None => false,
        }
    }

    /// Marks acknowledged readings as accepted, returns the uids of the meters that changed
    pub fn confirm_readings(&self, confirmed: &[SubmittedReading]) -> Vec<String> {
        let mut accounts = lock(&self.accounts);
        let mut changed: Vec<String> = Vec::new();
        for reading in confirmed {
            let meter = accounts
                .iter_mut()
                .flat_map(|a| a.meters.iter_mut())
                .find(|m| m.uid == reading.meter);
            let Some(meter) = meter else {
                warn!("Acknowledged reading {} for unknown meter {}", reading.meter_reading_uid, reading.meter);
                continue;
            };
            let Some(tariff) = Zone::from_tariff_type(reading.tariff_type).and_then(|z| meter.tariff_mut(z)) else {
                warn!("Acknowledged reading {} for unknown tariff {}", reading.meter_reading_uid, reading.tariff_type);
                continue;
            };
            if tariff.accepted_value == Some(reading.value) {
                continue;
            }
            tariff.accepted_value = Some(reading.value);
            if !changed.contains(&meter.uid) {
                changed.push(meter.uid.clone());
            }
        }
        return changed;
    }

    pub fn classifiers(&self) -> Vec<TicketClassifier> {
        return lock(&self.classifiers).clone();
    }

    pub fn refresh_classifiers(&self) -> Result<usize, ClientError> {
        match self.client.fetch_classifiers() {
            Ok(fetched) => {
                let count = fetched.len();
                *lock(&self.classifiers) = fetched;
                info!("Loaded {count} ticket classifiers");
                Ok(count)
            },
            Err(e) => {
                error!("Error fetching ticket classifiers: {e}");
                Err(e)
            },
        }
    }
}

/// Stores what was sent for each zone, the accepted value only once the account confirmed it
pub fn record_submission(meter: &mut Meter, receipt: &SubmissionReceipt) {
    for reading in receipt.readings.iter() {
        let zone = Zone::from_tariff_type(reading.tariff_type);
        if let Some(tariff) = zone.and_then(|z| meter.tariff_mut(z)) {
            tariff.last_value = Some(reading.value);
            if receipt.confirmed {
                tariff.accepted_value = Some(reading.value);
            }
        }
    }
    meter.has_user_readings = true;
}
