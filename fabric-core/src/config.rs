//! process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "fabricd-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/fabricd/config.yaml";
    /// default database file path
    pub const DEFAULT_DATABASE_URL: &str = "/var/lib/fabricd/fabric.db";
    /// default instance id
    pub const DEFAULT_INSTANCE_ID: &str = "fabricd";
    /// default log level. Can use this argument or FABRIC_LOG env var
    pub const DEFAULT_FABRIC_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "fabricd", bin_name = "fabricd", about, long_about = None)]
    /// parses from cli & environment var. fabricd will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the service config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address to serve the http api on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// ID of this instance, only used for logging
        #[clap(long, env, value_parser, default_value = DEFAULT_INSTANCE_ID)]
        pub instance_id: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_FABRIC_LOG)]
        pub fabric_log: String,
        /// Path to the database use "sqlite::memory:" for in mem db ex. "em.db"
        /// NOTE: the database is shared by every agent process on the controller
        #[clap(short, long, env, value_parser, default_value = DEFAULT_DATABASE_URL)]
        pub database_url: String,
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

    use std::str;

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(fabric_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // Log level comes from FABRIC_LOG
            let filter = EnvFilter::try_new(fabric_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("russh=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
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
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
