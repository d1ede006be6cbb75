//! Shared application state

use std::sync::Arc;

use courier_shared::{NotificationStore, PgStore, RiderDirectory};
use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::realtime::{Bridge, ConnectionSettings, Hub};

/// Application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub riders: Arc<dyn RiderDirectory>,
    pub hub: Hub,
    /// `None` when no broker is configured
    pub bridge: Option<Bridge>,
    pub dispatcher: Dispatcher,
    pub jwt: JwtManager,
    pub connection_settings: ConnectionSettings,
}

impl AppState {
    /// Wire the realtime stack around one Postgres store
    pub fn new(config: Config, pool: PgPool, hub: Hub, bridge: Option<Bridge>) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        let notifications: Arc<dyn NotificationStore> = store.clone();
        let dispatcher = Dispatcher::new(
            notifications,
            hub.clone(),
            bridge.clone(),
            config.quiet_hours_offset,
        );

        Self {
            jwt: JwtManager::new(&config.jwt_secret),
            connection_settings: config.connection_settings(),
            config: Arc::new(config),
            pool,
            riders: store,
            hub,
            bridge,
            dispatcher,
        }
    }

    /// Bridge health as reported on `/health`
    pub fn bridge_status(&self) -> &'static str {
        match &self.bridge {
            Some(bridge) if bridge.is_connected() => "connected",
            Some(_) => "disconnected",
            None => "disabled",
        }
    }
}
