use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::info;

use procshare::cli::{Cli, Command, parse_value};
use procshare::config::Config;
use procshare::{EventBus, Launch, Supervisor, Worker};
use sharestore::{CallArgs, CallOutcome, ShareServer, StoreClient};

fn setup_logging(role: &str, level: &str) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("procshare")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Write to a log file, not stdout/stderr
    let level: tracing::Level = level.parse().context(format!("Invalid log level: {}", level))?;
    let log_file = fs::File::create(log_dir.join(format!("{}.log", role))).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (role: {}, level: {})", role, level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(cli.command.role(), &level).context("Failed to setup logging")?;

    info!(store = %config.store.socket_addr(), "share loaded config");

    match cli.command {
        Command::Serve { http_port } => serve(config, http_port).await,
        Command::Worker => run_worker(config).await,
        Command::Supervise { payload, duration_secs } => supervise(config, &payload, duration_secs).await,
        command => {
            let client = match &cli.http {
                Some(url) => StoreClient::http(url.clone(), config.store.secret.clone()),
                None => StoreClient::new(&config.store),
            };
            run_client(client, command).await
        }
    }
}

async fn serve(config: Config, http_port: Option<u16>) -> Result<()> {
    let mut store_config = config.store;
    if http_port.is_some() {
        store_config.http_port = http_port;
    }

    let server = ShareServer::spawn(&store_config)
        .await
        .context(format!("Failed to serve on {}", store_config.socket_addr()))?;
    println!("{} Serving store on {}", "✓".green(), server.socket_addr().to_string().cyan());
    if let Some(addr) = server.http_addr() {
        println!("{} HTTP binding on {}", "✓".green(), format!("http://{}", addr).cyan());
        println!("{} Uploads in {}", "✓".green(), server.files().dir().display());
    }

    let store = server.store().clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            server.shutdown().await;
        }
        _ = store.closed() => info!("Store shut down by KILL"),
    }
    server.wait().await;
    println!("{} Store stopped", "✓".green());
    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let worker = Worker::from_env(&config)
        .await
        .context(format!("Worker failed to connect to {}", config.store.socket_addr()))?;
    info!(id = ?worker.id(), payload = %worker.payload(), "Worker running");

    tokio::select! {
        _ = worker.wait_for_exit() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            worker.request_exit();
            worker.wait_for_exit().await;
        }
    }
    Ok(())
}

async fn supervise(config: Config, payload: &str, duration_secs: Option<u64>) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload must be JSON")?;
    let mut supervisor = Supervisor::start(config).await.context("Failed to connect to the store")?;
    if supervisor.is_hosting() {
        println!(
            "{} Hosting store on port {}",
            "✓".green(),
            supervisor.store_config().port.to_string().cyan()
        );
    }

    let result = run_supervised(&mut supervisor, &payload, duration_secs).await;
    supervisor.cleanup().await;
    println!("{} Worker state: {:?}", "✓".green(), supervisor.worker_state());
    result
}

async fn run_supervised(supervisor: &mut Supervisor, payload: &Value, duration_secs: Option<u64>) -> Result<()> {
    match supervisor.launch_client_process(payload, true).await? {
        Launch::Launched => {
            let id = supervisor.worker().map(|w| w.id.clone()).unwrap_or_default();
            println!("{} Worker {} verified", "✓".green(), id.cyan());
        }
        Launch::AlreadyRunning => println!("{} Worker already running", "•".yellow()),
    }

    match duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
        }
    }
    Ok(())
}

async fn run_client(client: StoreClient, command: Command) -> Result<()> {
    let endpoint = client.endpoint();
    let unreachable_msg = || format!("Failed to reach store at {}", endpoint);

    match command {
        Command::Set { key, value } => {
            client.set_data(&key, parse_value(&value)).await.context(unreachable_msg())?;
            println!("{} {}", "✓".green(), key);
        }
        Command::Get { keys } => {
            let found = if keys.len() == 1 {
                client.get_data(&keys[0]).await.context(unreachable_msg())?
            } else {
                client.get_many(&keys).await.context(unreachable_msg())?.map(Value::Object)
            };
            match found {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("{}", "(no data)".dimmed()),
            }
        }
        Command::Del { key } => {
            if client.delete_data(&key).await.context(unreachable_msg())? {
                println!("{} Deleted {}", "✓".green(), key);
            } else {
                println!("{} {} not found", "•".yellow(), key);
            }
        }
        Command::Has { key } => {
            println!("{}", client.has_data(&key).await.context(unreachable_msg())?);
        }
        Command::Keys => {
            for key in client.list_keys().await.context(unreachable_msg())? {
                println!("{}", key);
            }
        }
        Command::Data => {
            for (key, value) in client.list_data().await.context(unreachable_msg())? {
                println!("{} {}", key.yellow(), value);
            }
        }
        Command::Clear => {
            client.clear_data().await.context(unreachable_msg())?;
            println!("{} Cleared", "✓".green());
        }
        Command::Fire { event, value } => {
            EventBus::new(client)
                .fire_event(&event, parse_value(&value))
                .await
                .context(unreachable_msg())?;
            println!("{} Fired {}", "✓".green(), event);
        }
        Command::Call { method, args } => {
            let args = CallArgs::new(args.iter().map(|a| parse_value(a)).collect());
            match client.call_method(&method, args).await.context(unreachable_msg())? {
                CallOutcome::Returned(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                CallOutcome::MethodNotFound(name) => {
                    eyre::bail!("Method {} not found", name);
                }
            }
        }
        Command::Kill => {
            client.kill().await.context(unreachable_msg())?;
            println!("{} Store shutting down", "✓".green());
        }
        other => eyre::bail!("{} is not a client command", other.role()),
    }
    Ok(())
}
