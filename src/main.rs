//! Binary entry point. Exit codes per spec.md §6: 0 on a clean shutdown
//! (SIGINT/SIGTERM), 1 on any fatal startup or liveness failure. Grounded on
//! the teacher's `main()` — tracing-subscriber init, layered settings,
//! background tasks registered against one shared `CancellationToken`.

use std::path::PathBuf;
use std::sync::Arc;

use bunkerd::auth::AuthEngine;
use bunkerd::config_store::{self, ConfigDoc};
use bunkerd::db;
use bunkerd::error::Error;
use bunkerd::identity::{IdentityDocument, IdentityFileWriter, JsonFileWriter};
use bunkerd::key_store::{self, KeyStore};
use bunkerd::ledger;
use bunkerd::liveness::LivenessMonitor;
use bunkerd::relay::{RelayTransport, WebsocketRelay};
use bunkerd::rpc::admin::AdminPlane;
use bunkerd::rpc::user::UserPlane;
use bunkerd::settings::{self, Cli, Command, StartArgs};
use bunkerd::web::{self, AppState, PlainRenderer};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Setup { config } => setup(&config),
        Command::Add { name, config } => add_key(&name, &config),
        Command::Start(args) => start(args).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn setup(config_path: &PathBuf) -> Result<(), Error> {
    init_tracing(false);
    let cfg = config_store::get(config_path)?;
    info!(admin_pubkey = %cfg.admin_signing_key()?.public_key_hex(), "bunker initialized");
    Ok(())
}

fn add_key(name: &str, config_path: &PathBuf) -> Result<(), Error> {
    init_tracing(false);
    let mut cfg = config_store::get(config_path)?;
    if cfg.keys.contains_key(name) {
        return Err(Error::Conflict(format!("key {name} already exists")));
    }
    let passphrase = rpassword::prompt_password(format!("passphrase for {name}: "))
        .map_err(|e| Error::Internal(format!("failed to read passphrase: {e}")))?;
    let material = bunkerd::crypto::PrivateKeyMaterial::generate();
    let pubkey = material.public_key_hex();
    let encrypted = key_store::encrypt(&material.secret_bytes(), &passphrase)?;
    cfg.keys.insert(name.to_string(), encrypted);
    config_store::put(config_path, cfg)?;
    info!(name, pubkey, "key added");
    Ok(())
}

async fn start(args: StartArgs) -> Result<(), Error> {
    init_tracing(args.verbose);
    let _settings = settings::load(args.verbose)?;

    let mut cfg: ConfigDoc = config_store::get(&args.config)?;
    for extra_admin in &args.admins {
        if !cfg.admin_pubkeys.contains(extra_admin) {
            cfg.admin_pubkeys.push(extra_admin.clone());
        }
    }

    let db_path = args.config.with_file_name("bunkerd.sqlite3");
    let pool = db::connect(&db_path).await?;

    let key_store = Arc::new(KeyStore::new());
    for key_name in &args.keys {
        let entry = cfg
            .keys
            .get(key_name)
            .ok_or_else(|| Error::NotFound(format!("key {key_name}")))?;
        let passphrase = rpassword::prompt_password(format!("passphrase for {key_name}: "))
            .map_err(|e| Error::Internal(format!("failed to read passphrase: {e}")))?;
        key_store.unlock(key_name, entry, &passphrase)?;
    }

    let admin_signer = cfg.admin_signing_key()?;
    let transport: Arc<dyn RelayTransport> =
        Arc::new(WebsocketRelay::new(cfg.admin_plane_relays.clone()));

    let admin_plane = Arc::new(AdminPlane::new(
        pool.clone(),
        key_store.clone(),
        args.config.clone(),
        transport.clone(),
        admin_signer,
    ));
    admin_plane.announce_connection_string().await?;
    write_identity_document(&args.config, &cfg, &key_store).await?;

    let cancel = CancellationToken::new();
    let wake_table = Arc::new(ledger::WakeTable::new());
    let auth = Arc::new(AuthEngine::new(
        pool.clone(),
        wake_table.clone(),
        cfg.public_base_url.clone(),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(ledger::run_expiry_sweeper(
        pool.clone(),
        cancel.clone(),
    )));

    let liveness = LivenessMonitor::new();
    admin_plane.set_liveness_monitor(liveness.clone());
    tasks.push(tokio::spawn(liveness.run(
        transport.clone(),
        admin_plane.admin_pubkey(),
        cancel.clone(),
    )));

    {
        let admin_plane = admin_plane.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin_plane.run(cancel).await {
                error!(error = %e, "admin plane exited");
            }
        }));
    }

    if cfg.public_base_url.is_some() {
        let state = Arc::new(AppState {
            pool: pool.clone(),
            wake_table: wake_table.clone(),
            renderer: Arc::new(PlainRenderer),
        });
        let listener = tokio::net::TcpListener::bind(&args.web_bind)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind web UI: {e}")))?;
        info!(addr = %args.web_bind, "approval web UI listening");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, web::router(state)).await {
                error!(error = %e, "approval web UI exited");
            }
        }));
    }

    for key_name in key_store.unlocked_names() {
        let user_plane = Arc::new(UserPlane::new(
            key_name,
            key_store.clone(),
            transport.clone(),
            auth.clone(),
            admin_plane.clone(),
        ));
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = user_plane.run(cancel).await {
                error!(error = %e, "user plane exited");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("failed to listen for shutdown signal: {e}")))?;
    info!("shutdown signal received");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn write_identity_document(
    config_path: &std::path::Path,
    cfg: &ConfigDoc,
    key_store: &KeyStore,
) -> Result<(), Error> {
    let mut names = std::collections::BTreeMap::new();
    let mut nip46 = std::collections::BTreeMap::new();
    for name in key_store.unlocked_names() {
        if let Some(pubkey) = key_store.public_key_hex(&name) {
            names.insert(name, pubkey.clone());
            nip46.insert(pubkey, cfg.user_plane_relays.clone());
        }
    }
    let doc = IdentityDocument {
        names,
        relays: std::collections::BTreeMap::new(),
        nip46,
    };
    let writer = JsonFileWriter::new(config_path.with_file_name("nostr.json"));
    writer.write(&doc).await
}
