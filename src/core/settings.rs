use crate::core::model::Settings;
use std::sync::Arc;
use tokio::sync::watch;

/// Current settings plus change notification.
#[derive(Clone)]
pub struct SettingsProvider {
    tx: Arc<watch::Sender<Settings>>,
}

impl SettingsProvider {
    pub fn new(initial: Settings) -> Self {
        let (tx, _) = watch::channel(initial.normalized());
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn set(&self, settings: Settings) {
        self.tx.send_replace(settings.normalized());
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}
