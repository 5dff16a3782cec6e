//! Start-up configuration: CLI/env parsing, tracing setup and the validated
//! [`RegistryConfig`] handed to every component.

use std::time::Duration;

use crate::{
    error::ConfigError,
    instance::{validate_service_name, InstanceInfo, Namespace},
    recovery::{ConnectSettings, RetryPolicy},
};

pub mod cli {
    //! Parse from either cli or env var

    /// default session timeout in milliseconds
    pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 2_000;
    /// default address advertised in our instance node
    pub static DEFAULT_ADVERTISE_ADDR: &str = "127.0.0.1";
    /// default number of recovery attempts after an expiry
    pub const DEFAULT_RECOVERY_RETRY_MAX: u32 = 3;
    /// default delay after the first failed recovery attempt
    pub const DEFAULT_RECOVERY_BACKOFF_MS: u64 = 500;
    /// default seconds between registry reports, 0 disables them
    pub const DEFAULT_REPORT_INTERVAL: u64 = 60;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "burrow-worker";
    /// default log level. Can use this argument or BURROW_LOG env var
    pub const DEFAULT_BURROW_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub static DEFAULT_LOG_FORMAT: &str = "standard";

    use std::{net::Ipv4Addr, time::Duration};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "burrow", bin_name = "burrow", about, long_about = None)]
    /// parses from cli & environment var. burrow will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// coordination store address, e.g. "zk-1:2181,zk-2:2181"
        #[clap(long, env, value_parser)]
        pub zk_addr: String,
        /// session timeout in milliseconds, also bounds the wait for a session to connect
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SESSION_TIMEOUT_MS)]
        pub session_timeout_ms: u64,
        /// root path every service registers under, e.g. "/service"
        #[clap(long, env, value_parser)]
        pub namespace: String,
        /// service name this process registers as
        #[clap(long, env, value_parser)]
        pub application_name: String,
        /// port this process serves on
        #[clap(long, env, value_parser)]
        pub server_port: u16,
        /// address published in our instance node
        #[clap(long, env, value_parser, default_value = DEFAULT_ADVERTISE_ADDR)]
        pub advertise_addr: Ipv4Addr,
        /// recovery attempts after a session expires
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECOVERY_RETRY_MAX)]
        pub recovery_retry_max: u32,
        /// delay after the first failed recovery attempt, doubled after each further failure
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECOVERY_BACKOFF_MS)]
        pub recovery_backoff_ms: u64,
        /// seconds between registry reports, 0 disables them
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REPORT_INTERVAL)]
        pub report_interval: u64,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_BURROW_LOG)]
        pub burrow_log: String,
        /// log format
        #[clap(long, env, value_parser = ["standard", "json", "pretty"], default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// session timeout as `Duration`
        pub fn session_timeout(&self) -> Duration {
            Duration::from_millis(self.session_timeout_ms)
        }

        /// report interval as `Duration`, `None` if disabled
        pub fn report_interval(&self) -> Option<Duration> {
            (self.report_interval > 0).then(|| Duration::from_secs(self.report_interval))
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for tracing output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. `burrow_log` accepts any RUST_LOG
        /// directive; unknown formats fall back to "standard".
        pub fn parse(burrow_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(burrow_log).or_else(|_| EnvFilter::try_new("info"))?;

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .try_init()?;
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .try_init()?;
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .try_init()?;
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}

/// Validated settings shared by every component. Built once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// where sessions are opened
    pub connect: ConnectSettings,
    /// root of the service tree
    pub namespace: Namespace,
    /// this process's instance
    pub local: InstanceInfo,
    /// recovery retry policy
    pub retry: RetryPolicy,
    /// how often the binary logs a registry report
    pub report_interval: Option<Duration>,
}

impl RegistryConfig {
    /// Settings with default retry policy and reporting.
    pub fn new(connect: ConnectSettings, namespace: Namespace, local: InstanceInfo) -> Self {
        Self {
            connect,
            namespace,
            local,
            retry: RetryPolicy::default(),
            report_interval: Some(Duration::from_secs(cli::DEFAULT_REPORT_INTERVAL)),
        }
    }

    /// Validate parsed CLI/env settings.
    pub fn from_cli(config: &cli::Config) -> Result<Self, ConfigError> {
        let address = config.zk_addr.trim();
        if address.is_empty() {
            return Err(ConfigError::Missing("zk_addr"));
        }
        if config.session_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "session_timeout_ms",
                reason: "must be greater than 0".into(),
            });
        }
        let namespace = Namespace::new(config.namespace.trim())?;
        let service_name = config.application_name.trim();
        validate_service_name(service_name)?;
        if config.server_port == 0 {
            return Err(ConfigError::Invalid {
                key: "server_port",
                reason: "must be greater than 0".into(),
            });
        }
        if config.recovery_retry_max == 0 {
            return Err(ConfigError::Invalid {
                key: "recovery_retry_max",
                reason: "at least one attempt is required".into(),
            });
        }

        let initial_backoff = Duration::from_millis(config.recovery_backoff_ms);
        Ok(Self {
            connect: ConnectSettings {
                address: address.to_owned(),
                session_timeout: config.session_timeout(),
            },
            namespace,
            local: InstanceInfo::new(service_name, config.advertise_addr, config.server_port),
            retry: RetryPolicy {
                max_attempts: config.recovery_retry_max,
                initial_backoff,
                max_backoff: RetryPolicy::default().max_backoff.max(initial_backoff),
            },
            report_interval: config.report_interval(),
        })
    }
}
