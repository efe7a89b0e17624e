use serde::{Deserialize, Serialize};
use std::fmt;
use chrono::{DateTime, NaiveDate, Utc};
use utoipa::ToSchema;

/// Lowercase ascii alphanumerics, everything else becomes `_`
fn safe_id(id: &str) -> String {
    return id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
}


/// Tariff zone of a meter, maps to the tariff type numbers 1..3 of the account API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
pub enum Zone {
    T1,
    T2,
    T3,
}

impl Zone {
    pub const ALL: [Zone; 3] = [Zone::T1, Zone::T2, Zone::T3];

    /// Accepts `t1`, `T1` or a bare `1`
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        let number = s.strip_prefix('t').or_else(|| s.strip_prefix('T')).unwrap_or(s);
        match number.parse::<u8>() {
            Ok(n) => Zone::from_tariff_type(n),
            Err(_) => None,
        }
    }

    pub fn from_tariff_type(tariff_type: u8) -> Option<Self> {
        match tariff_type {
            1 => Some(Zone::T1),
            2 => Some(Zone::T2),
            3 => Some(Zone::T3),
            _ => None,
        }
    }

    /// Zone for a positional reading, position 0 is T1
    pub fn from_position(position: usize) -> Option<Self> {
        Zone::ALL.get(position).copied()
    }

    pub fn tariff_type(&self) -> u8 {
        match self {
            Zone::T1 => 1,
            Zone::T2 => 2,
            Zone::T3 => 3,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.tariff_type())
    }
}

/// Resource measured by a meter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MeterResourceType {
    #[default]
    Unknown,
    ColdWater,
    HotWater,
    Electricity,
    Gas,
    Heating,
    GasTanks,
    SolidFuel,
    WasteWater,
}

impl MeterResourceType {
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => MeterResourceType::ColdWater,
            2 => MeterResourceType::HotWater,
            3 => MeterResourceType::Electricity,
            4 => MeterResourceType::Gas,
            5 => MeterResourceType::Heating,
            6 => MeterResourceType::GasTanks,
            7 => MeterResourceType::SolidFuel,
            8 => MeterResourceType::WasteWater,
            _ => MeterResourceType::Unknown,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            MeterResourceType::Unknown => "Unknown Type".to_string(),
            MeterResourceType::ColdWater => "Cold Water".to_string(),
            MeterResourceType::HotWater => "Hot Water".to_string(),
            MeterResourceType::Electricity => "Electricity".to_string(),
            MeterResourceType::Gas => "Gas".to_string(),
            MeterResourceType::Heating => "Heating".to_string(),
            MeterResourceType::GasTanks => "Gas Tanks".to_string(),
            MeterResourceType::SolidFuel => "Solid Fuel".to_string(),
            MeterResourceType::WasteWater => "Waste Water".to_string(),
        }
    }

    pub fn device_class(&self) -> &'static str {
        match self {
            MeterResourceType::ColdWater | MeterResourceType::HotWater | MeterResourceType::WasteWater => "water",
            MeterResourceType::Electricity => "energy",
            MeterResourceType::Gas | MeterResourceType::GasTanks => "gas",
            _ => "",
        }
    }
}

/// One tariff zone of a meter with the values known about it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TariffZone {
    pub zone: Zone,
    /// Current value as known from the account
    pub value: f64,
    /// Last value submitted through this bridge
    #[serde(default)]
    pub last_value: Option<f64>,
    /// Last value confirmed by the account
    #[serde(default)]
    pub accepted_value: Option<f64>,
    #[serde(default)]
    pub average_in_month: Option<f64>,
}

impl TariffZone {
    pub fn new(zone: Zone, value: f64) -> Self {
        return TariffZone {
            zone,
            value,
            last_value: None,
            accepted_value: None,
            average_in_month: None,
        };
    }

    /// Highest value recorded for this zone, new readings must not go below it
    pub fn floor(&self) -> f64 {
        let mut floor = self.value;
        for v in [self.last_value, self.accepted_value].into_iter().flatten() {
            floor = floor.max(v);
        }
        return floor;
    }
}

fn window_start_day_default() -> u32 { 15 }
fn window_end_day_default() -> u32 { 25 }

/// Inclusive day-of-month range in which readings are accepted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SubmissionWindow {
    #[serde(default="window_start_day_default")]
    pub start_day: u32,
    #[serde(default="window_end_day_default")]
    pub end_day: u32,
}

impl Default for SubmissionWindow {
    fn default() -> Self {
        return SubmissionWindow { start_day: window_start_day_default(), end_day: window_end_day_default() };
    }
}

impl SubmissionWindow {
    pub fn new(start_day: u32, end_day: u32) -> Self {
        return SubmissionWindow { start_day, end_day };
    }

    pub fn contains(&self, day: u32) -> bool {
        return self.start_day <= day && day <= self.end_day;
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start_day < 1 || self.end_day > 31 {
            return Err(format!("submission window {}..{} is outside of 1..31", self.start_day, self.end_day));
        }
        if self.start_day > self.end_day {
            return Err(format!("submission window starts on day {} after it ends on day {}", self.start_day, self.end_day));
        }
        Ok(())
    }
}

fn meter_type_default() -> String { return "meter".to_string() }
fn meter_unit_default() -> String { return "".to_string() }

/// Snapshot of a meter as held by the account store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Meter {
    pub uid: String,
    #[serde(default="meter_type_default")]
    pub meter_type: String,
    /// Factory number printed on the meter
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resource_type: MeterResourceType,
    #[serde(default="meter_unit_default")]
    pub unit_name: String,
    #[serde(default)]
    pub is_auto: bool,
    #[serde(default)]
    pub has_user_readings: bool,
    #[serde(default)]
    pub window: SubmissionWindow,
    pub tariffs: Vec<TariffZone>,
}

impl Meter {
    pub fn new(uid: &str, tariffs: Vec<TariffZone>) -> Self {
        return Meter {
            uid: uid.to_string(),
            meter_type: meter_type_default(),
            code: None,
            name: None,
            resource_type: MeterResourceType::Unknown,
            unit_name: meter_unit_default(),
            is_auto: false,
            has_user_readings: false,
            window: SubmissionWindow::default(),
            tariffs,
        };
    }

    pub fn zone_count(&self) -> usize {
        return self.tariffs.len();
    }

    pub fn tariff(&self, zone: Zone) -> Option<&TariffZone> {
        self.tariffs.iter().find(|t| t.zone == zone)
    }

    pub fn tariff_mut(&mut self, zone: Zone) -> Option<&mut TariffZone> {
        self.tariffs.iter_mut().find(|t| t.zone == zone)
    }

    pub fn object_id(&self) -> String {
        return format!("pik_comfort_meter_{}", safe_id(&self.uid));
    }

    pub fn entity_id(&self) -> String {
        return format!("binary_sensor.{}", self.object_id());
    }

    /// A service target may name the entity, its object id or the meter uid
    pub fn matches_target(&self, target: &str) -> bool {
        let target = target.trim();
        return target == self.uid || target == self.object_id() || target == self.entity_id();
    }

    pub fn display_name(&self) -> String {
        let meter_name = match (&self.name, &self.code) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(code)) => format!("№ {code}"),
            _ => self.uid.clone(),
        };
        return format!("{} ({})", meter_name, self.resource_type.to_string());
    }

    pub fn is_on(&self) -> bool {
        return self.is_auto || self.has_user_readings;
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tariffs.is_empty() || self.tariffs.len() > Zone::ALL.len() {
            return Err(format!("meter {} needs 1 to 3 tariff zones, has {}", self.uid, self.tariffs.len()));
        }
        for (i, tariff) in self.tariffs.iter().enumerate() {
            if self.tariffs[..i].iter().any(|t| t.zone == tariff.zone) {
                return Err(format!("meter {} lists zone {} twice", self.uid, tariff.zone));
            }
        }
        self.window.validate().map_err(|e| format!("meter {}: {e}", self.uid))
    }

    /// State document published for Home Assistant, keys follow `tariff_<n>_<field>`
    pub fn state_json(&self) -> serde_json::Value {
        let mut state = serde_json::Map::new();
        state.insert("is_on".to_string(), self.is_on().into());
        state.insert("is_auto".to_string(), self.is_auto.into());
        state.insert("has_user_readings".to_string(), self.has_user_readings.into());
        state.insert("factory_number".to_string(), self.code.clone().into());
        state.insert("resource_type".to_string(), serde_json::to_value(self.resource_type).unwrap_or_default());
        state.insert("unit_name".to_string(), self.unit_name.clone().into());
        state.insert("submission_start_day".to_string(), self.window.start_day.into());
        state.insert("submission_end_day".to_string(), self.window.end_day.into());

        let mut tariffs: Vec<&TariffZone> = self.tariffs.iter().collect();
        tariffs.sort_by_key(|t| t.zone);
        for tariff in tariffs {
            let n = tariff.zone.tariff_type();
            state.insert(format!("tariff_{n}_value"), tariff.value.into());
            state.insert(format!("tariff_{n}_monthly_average"), tariff.average_in_month.into());
            state.insert(format!("tariff_{n}_submitted_value"), tariff.last_value.into());
            state.insert(format!("tariff_{n}_accepted_value"), tariff.accepted_value.into());
        }
        return serde_json::Value::Object(state);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Unknown,
    Received,
    Denied,
    Processing,
    Completed,
}

impl TicketStatus {
    pub fn to_string(&self) -> String {
        match self {
            TicketStatus::Unknown => "unknown".to_string(),
            TicketStatus::Received => "received".to_string(),
            TicketStatus::Denied => "denied".to_string(),
            TicketStatus::Processing => "processing".to_string(),
            TicketStatus::Completed => "completed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Unknown,
    Processing,
    Accepted,
    Declined,
}

impl PaymentStatus {
    pub fn to_string(&self) -> String {
        match self {
            PaymentStatus::Unknown => "unknown".to_string(),
            PaymentStatus::Processing => "processing".to_string(),
            PaymentStatus::Accepted => "accepted".to_string(),
            PaymentStatus::Declined => "declined".to_string(),
        }
    }
}

/// Most recent payment made to an account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: String,
    pub amount: f64,
    #[serde(default)]
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payment_type: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub check_url: Option<String>,
}

/// Monthly bill of an account, amounts in RUB
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub period: NaiveDate,
    #[serde(default)]
    pub charge: f64,
    #[serde(default)]
    pub corrections: f64,
    #[serde(default)]
    pub subsidy: f64,
    #[serde(default)]
    pub penalty: f64,
    pub total: f64,
    #[serde(default)]
    pub paid: Option<f64>,
    #[serde(default)]
    pub debt: Option<f64>,
}

impl Receipt {
    /// What is still to be paid for the period
    pub fn balance(&self) -> f64 {
        return self.total - self.paid.unwrap_or(0.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: String,
    #[serde(default)]
    pub number: Option<String>,
    pub classifier_id: String,
    pub message: String,
    #[serde(default)]
    pub status: TicketStatus,
    pub created: DateTime<Utc>,
}

/// Support ticket category, only leaves (`has_children == false`) can be used for tickets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketClassifier {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub has_children: bool,
}

/// Personal account with its meters and tickets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub last_payment: Option<Payment>,
    #[serde(default)]
    pub last_receipt: Option<Receipt>,
}

impl Account {
    pub fn validate(&self) -> Result<(), String> {
        for meter in self.meters.iter() {
            meter.validate()?;
        }
        Ok(())
    }

    pub fn object_id(&self) -> String {
        return format!("pik_comfort_account_{}", safe_id(&self.id));
    }

    pub fn display_name(&self) -> String {
        match &self.number {
            Some(number) if !number.is_empty() => format!("Account {number}"),
            _ => format!("Account {}", self.id),
        }
    }

    /// Key of a ticket inside the `tickets` object of the state document
    pub fn ticket_key(ticket: &Ticket) -> String {
        return safe_id(&ticket.id);
    }

    /// State document for the payment, receipt and ticket sensors of the account
    pub fn state_json(&self) -> serde_json::Value {
        let mut state = serde_json::Map::new();
        state.insert("number".to_string(), self.number.clone().into());
        state.insert("address".to_string(), self.address.clone().into());
        state.insert("last_payment_status".to_string(), self.last_payment.as_ref().map(|p| p.status.to_string()).into());
        state.insert("last_payment".to_string(), serde_json::to_value(&self.last_payment).unwrap_or_default());
        state.insert("last_receipt_balance".to_string(), self.last_receipt.as_ref().map(|r| r.balance()).into());
        state.insert("last_receipt".to_string(), serde_json::to_value(&self.last_receipt).unwrap_or_default());

        let mut tickets = serde_json::Map::new();
        for ticket in self.tickets.iter() {
            tickets.insert(Account::ticket_key(ticket), serde_json::to_value(ticket).unwrap_or_default());
        }
        state.insert("tickets".to_string(), serde_json::Value::Object(tickets));
        return serde_json::Value::Object(state);
    }
}
