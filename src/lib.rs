//! PIK Comfort bridge library
//!
//! Decides whether meter readings may be submitted to a PIK Comfort personal
//! account, runs the integration services (readings, tickets, classifier
//! search) and exposes them over MQTT and HTTP.

pub mod models;
pub mod readings;
pub mod accounts;
pub mod services;
pub mod api;
pub mod mqtt;
pub mod config;

// Re-export common types for easier access
pub use models::{Account, Meter, TariffZone, Zone};
pub use readings::{PolicyEngine, ReadingsError};
pub use accounts::{AccountClient, AccountStore, OutboxClient};
pub use services::ServiceHandler;
pub use mqtt::{CALLBACKS, MqttManager};
pub use api::{ApiManager, AppState};
pub use config::CONFIG;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
}

/// Hides all but the last three characters, `79001234567` becomes `***567`
pub fn mask_username(username: &str) -> String {
    let chars: Vec<char> = username.chars().collect();
    if chars.len() <= 3 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 3..].iter().collect();
    return format!("***{tail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_username() {
        assert_eq!(mask_username("79001234567"), "***567");
        assert_eq!(mask_username("+7 (900) 123-45-67"), "***-67");
        assert_eq!(mask_username("12"), "***");
    }
}
