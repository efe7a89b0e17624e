use pikcomfort2mqtt::{
    accounts::{AccountStore, OutboxClient},
    api::{ApiManager, AppState},
    config::config_snapshot,
    mask_username,
    mqtt::{internal_commands::CommandHandler, publish_uptime, MqttManager},
    PolicyEngine, ServiceHandler, CONFIG,
};
use tokio::task::JoinHandle;
use std::{sync::{Arc, PoisonError}, time::Duration};
use log::{error, info};


#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("PIK_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = config_snapshot();
    info!("Starting {} for {}", config.pik.name, mask_username(&config.pik.phone_number));

    // we need a channel for the subparts to send their data to the broker
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    let (events, _) = tokio::sync::broadcast::channel(16);

    let client = Arc::new(OutboxClient::new(tx.clone(), config.pik.classifiers.clone()));
    let store = Arc::new(AccountStore::new(config.pik.accounts.clone(), client));
    let engine = PolicyEngine::new(config.readings.incremental_base);
    let services = Arc::new(
        ServiceHandler::new(store, engine, &config.pik.name, &config.pik.phone_number)
            .with_default_notification(config.readings.default_notification),
    );

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    let bsender = events.clone();
    threads.push(tokio::spawn(async move {
        mqtt.start_thread(bsender).await;
    }));

    /* Run our api gateway now */
    let api = ApiManager::new(AppState { services: services.clone(), sender: tx.clone(), events, ha_enabled: config.mqtt.ha_enabled }, config.httpd.clone());
    threads.push(tokio::spawn(async move {
        api.start_thread().await;
    }));

    /* Make sure to handle the dirty flag of the configuration */
    threads.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut c = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
            if c.is_dirty() {
                if let Err(e) = c.save() {
                    error!("Saving config failed: {e}");
                }
            }
        }
    }));

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    threads.push(tokio::spawn(async move {
        // Publish immediately on startup
        publish_uptime(&uptime_sender).await;

        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await; // Skip first immediate tick since we already published

        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender).await;
        }
    }));

    /* Last but not least start our command handling */
    let command = CommandHandler::new(tx, services, config.mqtt.ha_enabled);
    threads.push(tokio::spawn(async move {
        command.start_thread().await;
    }));


    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if threads.iter().any(|task| task.is_finished()) {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }

    /* Write pending account changes before leaving */
    if let Err(e) = CONFIG.write().unwrap_or_else(PoisonError::into_inner).save() {
        error!("Saving config failed: {e}");
    }
    Ok(())
}
