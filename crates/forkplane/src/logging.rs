//! Tracing setup shared by the master and the worker binary.
//!
//! `RUST_LOG` wins when set. Otherwise `FORKPLANE_LOG` picks the level for
//! this crate (`debug`, `info`, `warn`, `error`; default `info`).
//! `LOG_FORMAT=json` switches to JSON lines. Everything goes to stderr.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn directives(level: &str) -> String {
    format!("forkplane={level},forkplane_worker={level}")
}

/// Installs the global subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("FORKPLANE_LOG").ok().as_deref());
        EnvFilter::new(directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
