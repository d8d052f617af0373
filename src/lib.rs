pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod state;
pub mod platform {
    pub mod capture;
    pub mod device;
    pub mod hass;
    pub mod hub;
    pub mod shell;
}
pub mod tasks {
    pub mod art;
    pub mod listener;
    pub mod snapshot;
}
