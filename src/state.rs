use crate::{
    auth::Authenticator,
    config::Config,
    services::PersistenceBridge,
    store::{Directory, MessageStore},
    websocket::ConnectionRegistry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub persistence: PersistenceBridge,
    pub directory: Arc<dyn Directory>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let persistence = PersistenceBridge::new(store, registry.clone(), &config.persist);
        Self {
            registry,
            persistence,
            directory,
            auth,
            config,
        }
    }
}
