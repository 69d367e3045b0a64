//! websock-client command line
//!
//! - `hash`: print the transmitted form of a user/password pair
//! - `ping`: connect to a server and measure ping round trips

use anyhow::Context;
use clap::Parser;
use std::io::BufRead;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use websock_client::{
    config::{Command, PingArgs},
    Args, Connector, CredentialHasher, Credentials, Request,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("websock_client={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Hash { user, password } => {
            let password = match password {
                Some(password) => password,
                None => read_password()?,
            };
            println!("{}", CredentialHasher.hash(&user, &password));
            Ok(())
        }
        Command::Ping(ping) => run_ping(ping).await,
    }
}

fn read_password() -> anyhow::Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_ping(args: PingArgs) -> anyhow::Result<()> {
    let credentials = match (&args.user, &args.password) {
        (Some(user), Some(password)) if args.hashed => {
            Some(Credentials::prehashed(user.clone(), password.clone()))
        }
        (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password.clone())),
        (Some(_), None) => anyhow::bail!("--password is required with --user"),
        _ => None,
    };

    let connector = Connector::with_config(args.uri.clone(), args.connector_config());
    let engine = connector
        .connect(credentials)
        .await
        .with_context(|| format!("Failed to connect to {}", args.uri))?;
    info!(uri = %args.uri, "Connected");

    let mut failures = 0;
    for seq in 1..=args.count {
        let started = Instant::now();
        match engine.send_message(Request::ping()).await.wait().await {
            Ok(_) => info!(seq, rtt = ?started.elapsed(), "pong"),
            Err(e) => {
                failures += 1;
                warn!(seq, error = %e, "ping failed");
            }
        }
        if seq < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    connector.disconnect().await;
    if failures > 0 {
        error!(failures, count = args.count, "Some pings failed");
        anyhow::bail!("{failures} of {} pings failed", args.count);
    }
    Ok(())
}
