use serde::{Deserialize, Serialize};
use crate::models::{Account, Meter, Ticket, Zone};

pub const ORIGIN_NAME: &str = "pikcomfort2mqtt";
pub const MANAGEMENT_DEVICE: &str = "pik_comfort_management";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HaDevice {
    pub ids: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

impl HaOrigin {
    pub fn current() -> Self {
        return HaOrigin {
            name: ORIGIN_NAME.to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        };
    }
}

fn is_none_str(value: &String) -> bool {
    return value.is_empty();
}

#[derive(Serialize, PartialEq, Deserialize, Clone, Debug, Default)]
pub enum HAPlatform {
    #[default]
    Sensor,
    BinarySensor,
}

impl HAPlatform {
    pub fn to_string(&self) -> String {
        match self {
            HAPlatform::Sensor => "sensor".to_string(),
            HAPlatform::BinarySensor => "binary_sensor".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str", default)]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str", default)]
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    pub via_device: String,
    #[serde(skip_serializing_if = "is_none_str", default)]
    pub state_class: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_attributes_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_off: Option<bool>,
}

impl HaComponent {
    /// Binary sensor that is on once the meter has readings, carries the full state as attributes
    pub fn new_meter_state(meter: &Meter) -> Self {
        return HaComponent {
            p: HAPlatform::BinarySensor.to_string(),
            name: meter.display_name(),
            device_class: String::new(),
            unit_of_measurement: String::new(),
            value_template: "{{ value_json.is_on }}".to_string(),
            unique_id: meter.object_id(),
            object_id: meter.object_id(),
            via_device: MANAGEMENT_DEVICE.to_string(),
            state_class: String::new(),
            json_attributes_topic: Some(meter_state_topic(meter)),
            json_attributes_template: None,
            payload_on: Some(true),
            payload_off: Some(false),
        };
    }

    pub fn new_tariff(meter: &Meter, zone: Zone) -> Self {
        let n = zone.tariff_type();
        return HaComponent {
            p: HAPlatform::Sensor.to_string(),
            name: format!("{zone}"),
            device_class: meter.resource_type.device_class().to_string(),
            unit_of_measurement: meter.unit_name.clone(),
            value_template: format!("{{{{ value_json.tariff_{n}_value }}}}"),
            unique_id: format!("{}_tariff_{n}", meter.object_id()),
            object_id: format!("{}_tariff_{n}", meter.object_id()),
            via_device: MANAGEMENT_DEVICE.to_string(),
            state_class: "total_increasing".to_string(),
            json_attributes_topic: None,
            json_attributes_template: None,
            payload_on: None,
            payload_off: None,
        };
    }

    /* account sensors take their attributes from a sub object of the account state */
    fn new_account_sensor(account: &Account, suffix: &str, name: String, value_template: String, attributes: String) -> Self {
        return HaComponent {
            p: HAPlatform::Sensor.to_string(),
            name,
            device_class: String::new(),
            unit_of_measurement: String::new(),
            value_template,
            unique_id: format!("{}_{suffix}", account.object_id()),
            object_id: format!("{}_{suffix}", account.object_id()),
            via_device: MANAGEMENT_DEVICE.to_string(),
            state_class: String::new(),
            json_attributes_topic: Some(account_state_topic(account)),
            json_attributes_template: Some(format!("{{{{ value_json.{attributes} | tojson }}}}")),
            payload_on: None,
            payload_off: None,
        };
    }

    /// State is the status of the last payment
    pub fn new_last_payment(account: &Account) -> Self {
        return HaComponent::new_account_sensor(
            account,
            "last_payment",
            "Last Payment".to_string(),
            "{{ value_json.last_payment_status }}".to_string(),
            "last_payment".to_string(),
        );
    }

    /// State is what is left to pay on the last receipt
    pub fn new_last_receipt(account: &Account) -> Self {
        let mut c = HaComponent::new_account_sensor(
            account,
            "last_receipt",
            "Last Receipt".to_string(),
            "{{ value_json.last_receipt_balance }}".to_string(),
            "last_receipt".to_string(),
        );
        c.device_class = "monetary".to_string();
        c.unit_of_measurement = "RUB".to_string();
        return c;
    }

    /// State is the ticket status, number and message go to the attributes
    pub fn new_ticket(account: &Account, ticket: &Ticket) -> Self {
        let key = Account::ticket_key(ticket);
        let name = match &ticket.number {
            Some(number) => format!("Ticket №{number}"),
            None => format!("Ticket {}", ticket.id),
        };
        return HaComponent::new_account_sensor(
            account,
            &format!("ticket_{key}"),
            name,
            format!("{{{{ value_json.tickets['{key}'].status }}}}"),
            format!("tickets['{key}']"),
        );
    }
}

pub fn meter_state_topic(meter: &Meter) -> String {
    return format!("pik_comfort/meters/{}", meter.object_id());
}

pub fn account_state_topic(account: &Account) -> String {
    return format!("pik_comfort/accounts/{}", account.object_id());
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub qos: u32,
    #[serde(skip_serializing, default)]
    pub discover_topic: String,
}

impl HaDiscover {
    /// One HA device per meter, a state binary sensor plus one sensor per tariff zone
    pub fn for_meter(meter: &Meter) -> Self {
        let mut cmps = serde_json::Map::new();
        if let Ok(v) = serde_json::to_value(HaComponent::new_meter_state(meter)) {
            cmps.insert("state".to_string(), v);
        }
        let mut zones: Vec<Zone> = meter.tariffs.iter().map(|t| t.zone).collect();
        zones.sort();
        for zone in zones {
            if let Ok(v) = serde_json::to_value(HaComponent::new_tariff(meter, zone)) {
                cmps.insert(format!("tariff_{}", zone.tariff_type()), v);
            }
        }

        return HaDiscover {
            discover_topic: format!("homeassistant/device/pik_comfort-{}/config", meter.object_id()),
            dev: HaDevice {
                ids: meter.object_id(),
                name: meter.display_name(),
                manufacturer: "PIK Comfort".to_string(),
                model: meter.resource_type.to_string(),
            },
            o: HaOrigin::current(),
            cmps,
            state_topic: meter_state_topic(meter),
            qos: 1,
        };
    }

    /// One HA device per account with the payment, receipt and ticket sensors
    pub fn for_account(account: &Account) -> Self {
        let mut cmps = serde_json::Map::new();
        if let Ok(v) = serde_json::to_value(HaComponent::new_last_payment(account)) {
            cmps.insert("last_payment".to_string(), v);
        }
        if let Ok(v) = serde_json::to_value(HaComponent::new_last_receipt(account)) {
            cmps.insert("last_receipt".to_string(), v);
        }
        for ticket in account.tickets.iter() {
            if let Ok(v) = serde_json::to_value(HaComponent::new_ticket(account, ticket)) {
                cmps.insert(format!("ticket_{}", Account::ticket_key(ticket)), v);
            }
        }

        return HaDiscover {
            discover_topic: format!("homeassistant/device/pik_comfort-{}/config", account.object_id()),
            dev: HaDevice {
                ids: account.object_id(),
                name: account.display_name(),
                manufacturer: "PIK Comfort".to_string(),
                model: "Personal account".to_string(),
            },
            o: HaOrigin::current(),
            cmps,
            state_topic: account_state_topic(account),
            qos: 1,
        };
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}
