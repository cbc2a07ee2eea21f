//! Configuration for connections, retries and the dispatcher

pub mod defaults;
mod settings;

pub use settings::{
    ClassificationRule, ConnectionSettings, DispatcherSettings, MuxConfig, RetrySettings,
};
