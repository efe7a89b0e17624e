use std::sync::{Arc, PoisonError};
use chrono::{Local, NaiveDate};
use log::{error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use crate::accounts::SubmittedReading;
use crate::config::CONFIG;
use crate::mqtt::ha_interface::{HaDiscover, MANAGEMENT_DEVICE};
use crate::mqtt::{publish_account_state, publish_meter_state, PublishData, SubscribeData, Transmission, TOPIC_PREFIX};
use crate::services::events::ServiceEvent;
use crate::services::{
    CreateTicketCall, PushReadingsCall, SearchClassifiersCall, ServiceError, ServiceHandler,
    SERVICE_CREATE_TICKET, SERVICE_PUSH_READINGS, SERVICE_SEARCH_TICKET_CLASSIFIERS,
};

fn parse_call<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, ServiceError> {
    return serde_json::from_str(payload).map_err(|e| ServiceError::Validation(e.to_string()));
}

pub struct CommandHandler {
   sender: Sender<Transmission>,
   services: Arc<ServiceHandler>,
   ha_enabled: bool,
}

impl CommandHandler {

  pub fn new(sender: Sender<Transmission>, services: Arc<ServiceHandler>, ha_enabled: bool) -> Self {
    return CommandHandler {
      sender: sender,
      services: services,
      ha_enabled: ha_enabled,
    }
  }

  async fn subscribe(&self, topic: &str) -> Receiver<String> {
    let (sender, receiver) = tokio::sync::mpsc::channel(10);
    let register = Transmission::Subscribe(SubscribeData {
        topic: topic.to_string(),
        sender
    });
    if self.sender.send(register).await.is_err() {
        error!("Unable to register for {topic}");
    }
    return receiver;
  }

  /// Runs one service call from its JSON payload, validation failures fire no event
  pub fn dispatch(&self, service: &str, payload: &str, today: NaiveDate) -> Vec<Result<ServiceEvent, ServiceError>> {
    match service {
        SERVICE_PUSH_READINGS => match parse_call::<PushReadingsCall>(payload) {
            Ok(call) => self.services.push_readings(&call, today),
            Err(e) => vec![Err(e)],
        },
        SERVICE_CREATE_TICKET => vec![parse_call::<CreateTicketCall>(payload).and_then(|call| self.services.create_ticket(&call))],
        SERVICE_SEARCH_TICKET_CLASSIFIERS => vec![parse_call::<SearchClassifiersCall>(payload).and_then(|call| self.services.search_ticket_classifiers(&call))],
        _ => vec![Err(ServiceError::Validation(format!("Unknown service {service}")))],
    }
  }

  async fn handle_service(&self, service: &str, payload: &str) {
    info!("Service call {service} received");
    let mut fired = false;
    for outcome in self.dispatch(service, payload, Local::now().date_naive()) {
        match outcome {
            Ok(event) => {
                fired = true;
                if self.sender.send(Transmission::Event(event)).await.is_err() {
                    error!("Unable to queue event of {service}");
                }
            },
            Err(e) => warn!("Service call {service} rejected: {e}"),
        }
    }

    if fired && service == SERVICE_PUSH_READINGS {
        self.publish_states().await;
        self.persist_accounts();
    }
    if fired && service == SERVICE_CREATE_TICKET {
        /* a new ticket brings a new sensor */
        if self.ha_enabled {
            self.announce_accounts().await;
        }
        self.publish_states().await;
        self.persist_accounts();
    }
  }

  /// Applies a readings acknowledgement from the transmitter, returns how many meters changed
  pub fn confirm_readings(&self, payload: &str) -> Result<usize, ServiceError> {
    let confirmed: Vec<SubmittedReading> = parse_call(payload)?;
    let changed = self.services.store().confirm_readings(&confirmed);
    for uid in changed.iter() {
        info!("Readings of meter {uid} accepted by the account");
    }
    return Ok(changed.len());
  }

  async fn handle_ack(&self, payload: &str) {
    match self.confirm_readings(payload) {
        Ok(0) => {},
        Ok(_) => {
            self.publish_states().await;
            self.persist_accounts();
        },
        Err(e) => warn!("Readings acknowledgement rejected: {e}"),
    }
  }

  async fn publish_states(&self) {
    for meter in self.services.store().meters() {
        publish_meter_state(&self.sender, &meter).await;
    }
    for account in self.services.store().accounts() {
        publish_account_state(&self.sender, &account).await;
    }
  }

  fn persist_accounts(&self) {
    let accounts = self.services.store().accounts();
    let mut config = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    config.update_accounts(accounts);
  }

  async fn announce(&self) {
    /* We are not using the HADiscover and HAComponent stuff here because we know the json  */
    let json = format!(r###"
        {{
          "dev": {{
            "ids":"{MANAGEMENT_DEVICE}",
            "name":"PIK Comfort Bridge",
            "manufacturer":"pikcomfort2mqtt",
            "model":"Bridge"
          }},
          "o": {{
            "name":"pikcomfort2mqtt",
            "sw_version":"{version}"
          }},
          "cmps":{{
            "restart": {{
              "p":"button",
              "device_class":"restart",
              "name":"restart",
              "object_id":"pik_comfort_bridge_restart",
              "payload_press":"restart",
              "unique_id":"{MANAGEMENT_DEVICE}_bridge_restart",
              "command_topic": "{TOPIC_PREFIX}/mgt/command"
            }},
            "uptime": {{
              "p":"sensor",
              "name":"uptime",
              "object_id":"pik_comfort_uptime",
              "unique_id":"{MANAGEMENT_DEVICE}_uptime",
              "state_topic": "{TOPIC_PREFIX}/mgt/uptime",
              "state_class": "measurement",
              "unit_of_measurement": "s"
            }}
          }}
        }}"###, version = env!("CARGO_PKG_VERSION"));

    let p = Transmission::Publish(PublishData {
        topic: "homeassistant/device/pik_comfort_bridge/config".to_string(),
        payload: json,
        qos: 0,
        retain: true,
    });
    let _ = self.sender.send(p).await;

    for meter in self.services.store().meters() {
        let _ = self.sender.send(Transmission::AutoDiscovery(HaDiscover::for_meter(&meter))).await;
    }
    self.announce_accounts().await;
  }

  async fn announce_accounts(&self) {
    for account in self.services.store().accounts() {
        let _ = self.sender.send(Transmission::AutoDiscovery(HaDiscover::for_account(&account))).await;
    }
  }

  pub async fn start_thread(&self) {
        info!("Starting CommandHandler thread");
        /* We need to subscribe to the MQTT topics and wait for data to fill our buffers */
        let mut commands = self.subscribe("mgt/command").await;
        let mut push_readings = self.subscribe(&format!("service/{SERVICE_PUSH_READINGS}")).await;
        let mut create_ticket = self.subscribe(&format!("service/{SERVICE_CREATE_TICKET}")).await;
        let mut search = self.subscribe(&format!("service/{SERVICE_SEARCH_TICKET_CLASSIFIERS}")).await;
        let mut readings_ack = self.subscribe("outbox/readings/ack").await;

        if self.ha_enabled {
            self.announce().await;
        }
        self.publish_states().await;

        info!("Start waiting for command messages");
        loop {
            tokio::select! {
                Some(c) = commands.recv() => {
                    info!("Received command {c}");
                    if c == "restart" {
                        /* if we exit that thread the rest will exit, too */
                        info!("Request to shutdown received");
                        return;
                    }
                },
                Some(payload) = push_readings.recv() => self.handle_service(SERVICE_PUSH_READINGS, &payload).await,
                Some(payload) = create_ticket.recv() => self.handle_service(SERVICE_CREATE_TICKET, &payload).await,
                Some(payload) = search.recv() => self.handle_service(SERVICE_SEARCH_TICKET_CLASSIFIERS, &payload).await,
                Some(payload) = readings_ack.recv() => self.handle_ack(&payload).await,
                else => {
                    warn!("All command channels closed");
                    return;
                }
            }
        }
  }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountStore, OutboxClient};
    use crate::models::{Account, Meter, TariffZone, TicketClassifier, Zone};
    use crate::readings::PolicyEngine;
    use crate::services::events::EventData;

    fn handler() -> (CommandHandler, Receiver<Transmission>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let account = Account {
            id: "0a1b2c3d-0000-4000-8000-000000000001".to_string(),
            number: None,
            address: None,
            meters: vec![Meter::new("m1", vec![TariffZone::new(Zone::T1, 10.0)])],
            tickets: Vec::new(),
            last_payment: None,
            last_receipt: None,
        };
        let classifiers = vec![TicketClassifier { id: "c1".to_string(), name: "Lift".to_string(), parent_id: None, has_children: false }];
        let store = Arc::new(AccountStore::new(vec![account], Arc::new(OutboxClient::new(tx.clone(), classifiers))));
        let services = Arc::new(ServiceHandler::new(store, PolicyEngine::default(), "PIK Comfort", "79001234567"));
        (CommandHandler::new(tx, services, true), rx)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_push_readings() {
        let (handler, mut rx) = handler();
        let outcomes = handler.dispatch(SERVICE_PUSH_READINGS, r#"{"entity_id": "m1", "readings": "12"}"#, day(20));
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap().success());

        match rx.recv().await {
            Some(Transmission::Publish(p)) => assert_eq!(p.topic, "pik_comfort/outbox/readings"),
            other => panic!("unexpected transmission {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_readings_ack_sets_accepted_value() {
        let (handler, mut rx) = handler();
        handler.dispatch(SERVICE_PUSH_READINGS, r#"{"entity_id": "m1", "readings": "12", "ignore_periods": true}"#, day(1));
        let ack = match rx.recv().await {
            Some(Transmission::Publish(p)) => p.payload,
            other => panic!("unexpected transmission {other:?}"),
        };
        let tariff = handler.services.store().meters()[0].tariff(Zone::T1).cloned().unwrap();
        assert_eq!(tariff.last_value, Some(12.0));
        assert_eq!(tariff.accepted_value, None);

        assert_eq!(handler.confirm_readings(&ack).unwrap(), 1);
        assert_eq!(handler.services.store().meters()[0].tariff(Zone::T1).unwrap().accepted_value, Some(12.0));
        assert_eq!(handler.confirm_readings(&ack).unwrap(), 0);
        assert!(matches!(handler.confirm_readings("{}"), Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_dispatch_rejects_bad_payloads() {
        let (handler, _rx) = handler();
        let outcomes = handler.dispatch(SERVICE_PUSH_READINGS, "not json", day(20));
        assert!(matches!(outcomes[0], Err(ServiceError::Validation(_))));

        let outcomes = handler.dispatch("reboot", "{}", day(20));
        assert!(matches!(outcomes[0], Err(ServiceError::Validation(_))));

        let outcomes = handler.dispatch(SERVICE_CREATE_TICKET, r#"{"account_id": "x"}"#, day(20));
        assert!(matches!(outcomes[0], Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_dispatch_search() {
        let (handler, _rx) = handler();
        let outcomes = handler.dispatch(SERVICE_SEARCH_TICKET_CLASSIFIERS, r#"{"query": "lift"}"#, day(1));
        match &outcomes[0] {
            Ok(ServiceEvent { data: EventData::SearchClassifiers(e), .. }) => assert_eq!(e.count, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
