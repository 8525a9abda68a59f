//! Mail sync supervisor.
//!
//! Speaks JSON Lines over stdio: account JSON in (flag or first line),
//! task/body frames in, change deltas out. Logs go to stderr so stdout
//! stays a clean frame stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mailsync::account::Account;
use mailsync::comm_stream::{self, InboundFrame};
use mailsync::imap::session::Session;
use mailsync::store::Store;
use mailsync::sync_worker::{SyncWorker, WorkerEvent};
use mailsync::task_processor::TaskProcessor;
use mailsync::smtp;

/// How long after stdin closes the process waits before terminating itself.
const ORPHAN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sync,
    Test,
    Migrate,
}

#[derive(Debug)]
struct CliArgs {
    mode: Mode,
    account: Option<String>,
    orphan: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut mode = None;
    let mut account = None;
    let mut orphan = false;

    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--mode=") {
            mode = Some(match value {
                "sync" => Mode::Sync,
                "test" => Mode::Test,
                "migrate" => Mode::Migrate,
                other => return Err(anyhow!("unknown mode {other:?}")),
            });
        } else if let Some(value) = arg.strip_prefix("--account=") {
            account = Some(value.to_string());
        } else if arg == "--orphan" {
            orphan = true;
        } else {
            return Err(anyhow!("unrecognized argument {arg:?}"));
        }
    }

    Ok(CliArgs {
        mode: mode.context("--mode=<sync|test|migrate> is required")?,
        account,
        orphan,
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = main_impl().await;
    if let Err(err) = &result {
        error!("{err:#}");
    }
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}

async fn main_impl() -> Result<()> {
    let args = parse_args()?;
    let config_dir = PathBuf::from(
        std::env::var("CONFIG_DIR_PATH").unwrap_or_else(|_| ".".to_string()),
    );

    match args.mode {
        Mode::Migrate => {
            // Opening the store runs the migrations.
            Store::open(&config_dir, None)?;
            info!("migrations complete");
            Ok(())
        }
        Mode::Test => run_test_mode(args).await,
        Mode::Sync => run_sync_mode(args, config_dir).await,
    }
}

async fn read_account(
    args: &CliArgs,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Arc<Account>> {
    let json = match &args.account {
        Some(json) => json.clone(),
        None => lines
            .next_line()
            .await?
            .context("expected account JSON as the first line on stdin")?,
    };
    Ok(Arc::new(Account::from_json(&json)?))
}

// ---- test mode ----------------------------------------------------------

async fn run_test_mode(args: CliArgs) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let account = read_account(&args, &mut lines).await?;

    let mut log = String::new();
    let outcome = test_account(&account, &mut log).await;
    let (error_text, error_service) = match &outcome {
        Ok(()) => (serde_json::Value::Null, serde_json::Value::Null),
        Err((service, err)) => (
            serde_json::Value::String(format!("{err:#}")),
            serde_json::Value::String(service.to_string()),
        ),
    };

    // The verdict is the final frame on stdout.
    println!(
        "{}",
        serde_json::json!({
            "error": error_text,
            "error_service": error_service,
            "log": log,
            "account": &*account,
        })
    );

    outcome.map_err(|(service, err)| err.context(format!("{service} connection test failed")))
}

async fn test_account(
    account: &Account,
    log: &mut String,
) -> std::result::Result<(), (&'static str, anyhow::Error)> {
    log.push_str("Connecting to IMAP...\n");
    let mut session = Session::connect(account).await.map_err(|e| ("imap", e))?;

    log.push_str("Fetching folder list...\n");
    let folders = session.list_folders().await.map_err(|e| ("imap", e))?;
    for folder in &folders {
        log.push_str(&format!("- {} ({})\n", folder.path, folder.role));
    }
    if !folders.iter().any(|f| matches!(f.role, "all" | "inbox")) {
        return Err((
            "imap",
            anyhow!("account has neither an inbox nor an all-mail folder"),
        ));
    }

    log.push_str("Connecting to SMTP...\n");
    let transport = smtp::transport(account).map_err(|e| ("smtp", e))?;
    let reachable = transport
        .test_connection()
        .await
        .map_err(|e| ("smtp", anyhow::Error::new(e)))?;
    if !reachable {
        return Err(("smtp", anyhow!("SMTP connection test failed")));
    }
    log.push_str("Success!\n");
    Ok(())
}

// ---- sync mode ----------------------------------------------------------

async fn run_sync_mode(args: CliArgs, config_dir: PathBuf) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let account = read_account(&args, &mut lines).await?;
    info!("syncing account {} ({})", account.id, account.email_address);

    let (delta_tx, delta_rx) = comm_stream::delta_channel();
    let _writer = comm_stream::spawn_stdout_writer(delta_rx);
    let store = Arc::new(Store::open(&config_dir, Some(delta_tx))?);

    let (events_tx, events_rx) = async_channel::unbounded::<WorkerEvent>();
    let (first_sweep_tx, first_sweep_rx) = tokio::sync::oneshot::channel();

    // Background sweeper. A fatal sync error takes the process down.
    let background = SyncWorker::new("bg", account.clone(), store.clone(), None);
    tokio::spawn(async move {
        if let Err(err) = background.run_background(first_sweep_tx).await {
            error!("{err:#}");
            std::process::exit(1);
        }
    });

    // The foreground IDLE worker starts after the first completed sweep so
    // the folder list and sync state exist before it idles.
    {
        let account = account.clone();
        let store = store.clone();
        tokio::spawn(async move {
            if first_sweep_rx.await.is_err() {
                return;
            }
            let foreground = SyncWorker::new("fg", account, store, Some(events_rx));
            if let Err(err) = foreground.run_foreground().await {
                error!("{err:#}");
                std::process::exit(1);
            }
        });
    }

    // Main listener: client frames in, foreground wakeups out.
    let task_processor = TaskProcessor::new(account.clone(), store.clone());
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundFrame>(&line) {
            Ok(InboundFrame::TaskQueued { mut task }) => {
                task.version = 0;
                if let Err(err) = task_processor.perform_local(&mut task).await {
                    warn!("could not perform task {} locally: {err:#}", task.id);
                }
                events_tx.send(WorkerEvent::TaskReady).await.ok();
            }
            Ok(InboundFrame::NeedBodies { ids }) => {
                for id in ids {
                    events_tx.send(WorkerEvent::FetchBody(id)).await.ok();
                }
            }
            Err(err) => warn!("could not parse inbound frame: {err:#}"),
        }
    }

    // Orphan guard: our parent went away with the input stream. Give it a
    // moment (attached debuggers, restarts) and then terminate.
    if args.orphan {
        info!("input stream closed, --orphan set, staying alive");
        futures::future::pending::<()>().await;
    }
    info!(
        "input stream closed, exiting in {}s",
        ORPHAN_GRACE.as_secs()
    );
    tokio::time::sleep(ORPHAN_GRACE).await;
    Ok(())
}
