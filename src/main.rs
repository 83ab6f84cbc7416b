#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
mod config;
pub(crate) mod error;
pub(crate) mod forward;
pub(crate) mod inbound;
pub(crate) mod message;
pub(crate) mod smtp_server;

use config::Config;
use env_logger::Env;
use forward::ForwardClient;
use inbound::DomainFilterHandler;
use smtp_server::run_smtp_server;
use std::env;
use std::process;
use std::sync::Arc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!(
            "Usage: {} <config_file>",
            args.first().unwrap_or(&"mailhook".to_string())
        );
        process::exit(1);
    }

    let Some(config_path) = args.get(1) else {
        unreachable!("args length checked above")
    };

    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    let forwarder = match ForwardClient::new(config.forward.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to set up forward client: {}", e);
            process::exit(1);
        }
    };

    let handler = Arc::new(DomainFilterHandler::new(
        &config.smtp.accepted_domain,
        forwarder,
    ));
    let addr = format!("{}:{}", config.smtp.host, config.smtp.port);
    log::debug!("Accepting mail for @{}", config.smtp.accepted_domain);

    if let Err(e) = run_smtp_server(&addr, handler, config.smtp.max_message_size).await {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}
