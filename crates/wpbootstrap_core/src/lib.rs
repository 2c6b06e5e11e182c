pub mod assign;
pub mod config;
pub mod error;
pub mod import;
pub mod ledger;
pub mod manifest;
pub mod materialize;
pub mod model;
pub mod phpserial;
pub mod posts;
pub mod runtime;
pub mod snapshot;
pub mod store;
pub mod wpcli;
