//! One-shot ingestion runs for cron, plus a helper for encrypting mailbox
//! passwords before they go into `accounts.toml`.

use std::env;
use std::io::{self, BufRead};
use std::process::exit;

use helpdesk_module::accounts::{encrypt_secret, CredentialKey};
use helpdesk_module::service::{Pipeline, ServiceConfig};
use serde::Serialize;
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn print_usage() {
    eprintln!(
        r##"Usage: mail-ingest <command>

Commands:
  fetch             Fetch unseen mail from every enabled account into the queue
  process           Run one processing batch (queued email -> tickets)
  run               fetch, then process
  stats             Print queue counts per status
  encrypt-secret    Read a mailbox password from stdin and print it encrypted

Environment Variables:
  HELPDESK_CREDENTIALS_KEY   Key for mailbox password encryption
  ACCOUNTS_CONFIG_PATH       Mailbox definitions (default ./accounts.toml)
  EMAIL_QUEUE_BACKEND        sqlite (default) or postgres
  TICKET_SERVICE_URL         Ticket service base URL
  CLIENT_SERVICE_URL         Client service base URL
"##
    );
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        exit(2);
    };

    let result = match command.as_str() {
        "fetch" => load_pipeline().and_then(|pipeline| fetch(&pipeline)),
        "process" => load_pipeline().and_then(|pipeline| process(&pipeline)),
        "run" => load_pipeline().and_then(|pipeline| {
            if let Err(err) = fetch(&pipeline) {
                error!("fetch step failed, processing what is queued: {}", err);
            }
            process(&pipeline)
        }),
        "stats" => load_pipeline().and_then(|pipeline| print_json(&pipeline.stats()?)),
        "encrypt-secret" => encrypt_from_stdin(),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            exit(2);
        }
    };

    if let Err(err) = result {
        error!("mail-ingest {} failed: {}", command, err);
        exit(1);
    }
}

fn load_pipeline() -> Result<Pipeline, BoxError> {
    let config = ServiceConfig::from_env()?;
    Pipeline::from_config(&config)
}

fn fetch(pipeline: &Pipeline) -> Result<(), BoxError> {
    let summary = pipeline.fetch_once()?;
    print_json(&summary)?;
    if !summary.failures.is_empty() {
        return Err(format!("{} account(s) failed to fetch", summary.failures.len()).into());
    }
    Ok(())
}

/// An overlapping run holding the lock is not an error for cron.
fn process(pipeline: &Pipeline) -> Result<(), BoxError> {
    match pipeline.process_once() {
        Ok(report) => print_json(&report),
        Err(err) if err.is_locked() => {
            info!("skipping batch: {}", err);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn encrypt_from_stdin() -> Result<(), BoxError> {
    let key = CredentialKey::from_env()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let secret = line.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err("no secret on stdin".into());
    }
    println!("{}", encrypt_secret(&key, secret));
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
