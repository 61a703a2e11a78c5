//! Headless Sabycom demo.
//!
//! Runs a real widget session against the configured backend, with the widget page fetched
//! over HTTP instead of rendered and the message banner printed to stdout. Commands are read
//! from stdin; type `help` for the list.

mod command;
mod error;
mod presenter;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sabycom::{Sabycom, SessionDeps, User};
use sabycom_api::HttpRemoteApi;
use sabycom_connectivity::ReachabilityProbe;
use sabycom_core::config::{self, Config};
use sabycom_core::error::EventBusError;
use sabycom_core::event::{BroadcastEventBus, EventBus, EventPayload, EventSubscription};
use sabycom_storage::{OfflineArchive, SqliteKeyValueStore, open_database};

use crate::command::{Command, HELP};
use crate::error::DemoError;
use crate::presenter::StdoutBannerPresenter;
use crate::surface::HttpContentSurface;

const BANNER_ANCHOR: &str = "terminal";

/// Drive a Sabycom widget session from the terminal
#[derive(Debug, Parser)]
#[command(name = "sabycom-demo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the platform config path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Register this user id instead of the one in the config file
    #[arg(short = 'u', long)]
    user_id: Option<String>,

    /// Register an anonymous user
    #[arg(long, conflicts_with = "user_id")]
    anonymous: bool,

    /// Do not probe the network; use `online` / `offline` to flip reachability by hand
    #[arg(long)]
    no_probe: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::load_config(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level);

    if let Err(e) = run(args, config).await {
        error!(error = %e, "demo stopped");
        eprintln!("sabycom-demo: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args, config: Config) -> Result<(), DemoError> {
    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
    let request_timeout = Duration::from_secs(config.api.request_timeout_seconds);

    let database_path = config.storage.database_path();
    info!(path = %database_path.display(), "opening storage");
    let db = open_database(&database_path).await?;
    let kv = Arc::new(SqliteKeyValueStore::new(Arc::new(db)));
    let api = Arc::new(HttpRemoteApi::new(config.widget.host, request_timeout)?);

    let sdk = Arc::new(
        Sabycom::start(SessionDeps {
            kv,
            api,
            banner_presenter: Arc::new(StdoutBannerPresenter),
            archive: OfflineArchive::new(config.storage.archive_dir()),
            event_bus: event_bus.clone(),
            unread: config.unread.clone(),
            initially_online: true,
        })
        .await?,
    );
    sdk.initialize(&config.widget.app_id, config.widget.host)
        .await?;

    if args.anonymous {
        let user = sdk.register_anonymous_user().await?;
        println!("registered anonymous user {}", user.id);
    } else if let Some(user) = args
        .user_id
        .map(User::new)
        .or_else(|| config.user.clone().map(User::from))
    {
        println!("registered user {}", user.id);
        sdk.register_user(user).await?;
    } else {
        println!("no user configured, pass --user-id or --anonymous");
    }

    let probe = (!args.no_probe).then(|| {
        let probe = ReachabilityProbe::new(sdk.connectivity().clone(), &config.connectivity);
        tokio::spawn(probe.run())
    });

    let surface = Arc::new(HttpContentSurface::new(event_bus.clone(), request_timeout)?);
    let printer = tokio::spawn(print_events(
        sdk.clone(),
        surface.clone(),
        event_bus.subscribe("{ui,widget}.**")?,
    ));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = execute(&sdk, &surface, command).await {
            println!("error: {e}");
        }
    }

    sdk.shutdown();
    printer.abort();
    if let Some(probe) = probe {
        probe.abort();
    }
    Ok(())
}

async fn execute(
    sdk: &Sabycom,
    surface: &Arc<HttpContentSurface>,
    command: Command,
) -> Result<(), DemoError> {
    match command {
        Command::Show => sdk.show(surface.clone()).await?,
        Command::Hide => sdk.hide(),
        Command::Reload => sdk.reload().await,
        Command::Online => report(sdk, true),
        Command::Offline => report(sdk, false),
        Command::Foreground => sdk.app_will_enter_foreground().await,
        Command::Background => sdk.app_did_enter_background().await,
        Command::Push(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&raw) {
                Ok(payload) => {
                    if !sdk.handle_push(&payload, BANNER_ANCHOR) {
                        println!("not a push for the current widget user");
                    }
                }
                Err(e) => println!("{} is not JSON: {e}", path.display()),
            }
        }
        Command::Tap => sdk.banner().tap(),
        Command::Logout => {
            sdk.logout().await?;
            println!("logged out");
        }
        Command::Unread => println!("unread: {}", sdk.unread_count()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn report(sdk: &Sabycom, available: bool) {
    if !sdk.report_reachability(available) {
        println!("network already {}", if available { "online" } else { "offline" });
    }
}

async fn print_events(
    sdk: Arc<Sabycom>,
    surface: Arc<HttpContentSurface>,
    mut sub: EventSubscription,
) {
    loop {
        let event = match sub.recv().await {
            Ok(event) => event,
            Err(EventBusError::Lagged(count)) => {
                warn!(count, "event printer lagged, some events dropped");
                continue;
            }
            Err(_) => return,
        };

        match event.payload {
            EventPayload::LoadStateChanged { state, failure } => match failure {
                Some(failure) => println!("widget: {state} ({failure})"),
                None => println!("widget: {state}"),
            },
            EventPayload::UnreadCountChanged { count } => println!("unread: {count}"),
            EventPayload::WidgetCloseRequested => {
                println!("widget asked to close");
                sdk.hide();
            }
            EventPayload::OpenSessionRequested { .. } => {
                println!("opening the conversation");
                if let Err(e) = sdk.show(surface.clone()).await {
                    println!("error: {e}");
                }
            }
            _ => {}
        }
    }
}
