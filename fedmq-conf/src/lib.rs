#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use fedmq_utils::*;

use self::logging::Log;
use self::network::Network;

pub use self::network::NetworkConnector;
pub use self::options::Options;

pub mod logging;
pub mod network;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub statistics: Statistics,
    #[serde(default)]
    pub flow_control: FlowControl,
    #[serde(default)]
    pub network: Network,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/fedmq/fedmq").required(false))
            .add_source(File::with_name("fedmq").required(false))
            .add_source(
                config::Environment::with_prefix("fedmq")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("network.connectors.excluded_destinations"),
            );

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self::with_options(inner, opts))
    }

    /// Builds settings from TOML text, used by embedded brokers and tests.
    pub fn from_toml(text: &str) -> Result<Self> {
        let inner: Inner =
            Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()?;
        Ok(Self::with_options(inner, Options::default()))
    }

    fn with_options(mut inner: Inner, opts: Options) -> Self {
        //Command line configuration overriding file configuration
        if let Some(id) = opts.broker_id {
            inner.broker.id = id;
        }
        if let Some(name) = opts.broker_name.as_ref() {
            inner.broker.name.clone_from(name);
        }
        inner.opts = opts;
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("broker is {}@{}", self.broker.name, self.broker.id);
        log::info!("statistics config is: {:?}", self.statistics);
        log::info!("flow_control config is: {:?}", self.flow_control);
        for c in &self.network.connectors {
            log::info!("network connector: {:?}", c);
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    #[serde(default)]
    pub id: BrokerId,
    #[serde(default = "Broker::name_default")]
    pub name: String,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self { id: 0, name: Self::name_default() }
    }
}

impl Broker {
    fn name_default() -> String {
        "localhost".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statistics {
    //Master switch for destination statistics, disabling it also disables flow control.
    #[serde(default = "Statistics::enabled_default")]
    pub enabled: bool,
    //Whether admin resets are honoured.
    #[serde(default = "Statistics::reset_enabled_default")]
    pub reset_enabled: bool,
}

impl Default for Statistics {
    #[inline]
    fn default() -> Self {
        Self { enabled: Self::enabled_default(), reset_enabled: Self::reset_enabled_default() }
    }
}

impl Statistics {
    fn enabled_default() -> bool {
        true
    }
    fn reset_enabled_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowControl {
    //Usage ratio at or above which producers are blocked.
    #[serde(default = "FlowControl::usage_ceiling_default", deserialize_with = "deserialize_ratio")]
    pub usage_ceiling: f64,
    //Memory budget the usage ratio is measured against.
    #[serde(default = "FlowControl::memory_limit_default")]
    pub memory_limit: Bytesize,
    //How long a blocked send may wait, empty means wait until cancelled.
    #[serde(default, deserialize_with = "deserialize_duration_option")]
    pub send_timeout: Option<Duration>,
    #[serde(default = "FlowControl::poll_interval_default", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    //Fail immediately rather than block when the ceiling is reached.
    #[serde(default)]
    pub send_fail_if_no_space: bool,
}

impl Default for FlowControl {
    #[inline]
    fn default() -> Self {
        Self {
            usage_ceiling: Self::usage_ceiling_default(),
            memory_limit: Self::memory_limit_default(),
            send_timeout: None,
            poll_interval: Self::poll_interval_default(),
            send_fail_if_no_space: false,
        }
    }
}

impl FlowControl {
    fn usage_ceiling_default() -> f64 {
        1.0
    }
    fn memory_limit_default() -> Bytesize {
        Bytesize::from("64M")
    }
    fn poll_interval_default() -> Duration {
        Duration::from_millis(100)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml("").expect("Settings creation failed");
        assert_eq!(settings.broker.id, 0);
        assert!(settings.statistics.enabled);
        assert_eq!(settings.flow_control.usage_ceiling, 1.0);
        assert_eq!(settings.flow_control.send_timeout, None);
        assert!(settings.network.connectors.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let settings = Settings::from_toml(
            r#"
            [broker]
            id = 7
            name = "one"

            [log]
            to = "both"
            level = "warn"
            file = "broker2.log"

            [log.modules]
            "fedmq::bridge" = "debug"

            [flow_control]
            usage_ceiling = 0.8
            send_timeout = "2s"
            poll_interval = "10ms"

            [[network.connectors]]
            name = "network1"
            dynamic_only = true
            network_ttl = 3
            prefetch_size = 1000
            conduit_subscriptions = false
            "#,
        )
        .expect("Settings creation failed");

        assert_eq!(settings.broker.id, 7);
        assert_eq!(settings.broker.name, "one");
        assert_eq!(settings.log.to, logging::To::Both);
        assert_eq!(settings.log.level, slog::Level::Warning);
        assert_eq!(settings.log.file, "broker2.log");
        assert_eq!(settings.log.level_for("fedmq::bridge::credit"), slog::Level::Debug);
        assert_eq!(settings.log.level_for("fedmq::context"), slog::Level::Warning);
        assert_eq!(settings.flow_control.usage_ceiling, 0.8);
        assert_eq!(settings.flow_control.send_timeout, Some(Duration::from_secs(2)));
        assert_eq!(settings.flow_control.poll_interval, Duration::from_millis(10));
        let c = &settings.network.connectors[0];
        assert_eq!(c.name, "network1");
        assert!(c.dynamic_only);
        assert_eq!(c.network_ttl, 3);
        assert_eq!(c.prefetch_size, 1000);
        assert!(!c.conduit_subscriptions);
        assert!(!c.decrease_network_consumer_priority);
        assert!(c.dispatch_async);
    }

    #[test]
    fn test_options_override() {
        let opts = Options { broker_id: Some(42), ..Default::default() };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.broker.id, 42);
    }

    #[test]
    fn test_invalid_ceiling() {
        assert!(Settings::from_toml("[flow_control]\nusage_ceiling = 1.5\n").is_err());
    }
}
