use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plug_core::cfg::{self, AppId, Config};
use plug_core::{logx, Service};
use tokio::sync::watch;
use tracing::{info, warn};

mod housekeeping;
mod meross;
mod module;
#[cfg(feature = "web-api")]
mod web;

use housekeeping::Housekeeper;
use meross::MerossGateway;
use module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Delayed on/off switching for cloud smart plugs")]
struct Cli {
    /// Log level override (info,debug,trace)
    #[arg(long)]
    log: Option<String>,
    /// Read this config file instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,
    /// Control plane bind address override
    #[arg(long)]
    listen: Option<String>,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and its control plane (default)
    Serve,
    /// Sign in, print the device inventory and exit
    Devices,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => {
            let mut c = cfg::load_from(path)?;
            c.apply_env(|k| std::env::var(k).ok());
            c
        }
        None => cfg::load(&APP)?,
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    let level = cli.log.as_deref().unwrap_or(&cfg.log_level).to_string();
    logx::init(&level, cfg.log_json);

    runtime()?.block_on(run(cli.cmd.unwrap_or(Command::Serve), cfg))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    let mut builder = tokio::runtime::Builder::new_current_thread();
    #[cfg(not(feature = "rt-single"))]
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().build().context("build tokio runtime")
}

async fn run(cmd: Command, cfg: Config) -> Result<()> {
    let gateway = MerossGateway::from_config(&cfg.backend, cfg.scheduler.retry_policy().call_timeout)?;
    let service = Service::new(Arc::new(gateway), &cfg.scheduler);

    match cmd {
        Command::Devices => {
            let devices = service.test_connection().await.context("connection test")?;
            println!("{} device(s)", devices.len());
            for d in devices {
                let online = if d.online { "online" } else { "offline" };
                println!("  {:<24} {:<10} {:<8} {}", d.name, d.kind, online, d.id);
            }
            Ok(())
        }
        Command::Serve => serve(service, &cfg).await,
    }
}

async fn serve(service: Service, cfg: &Config) -> Result<()> {
    info!("{} boot", APP.application);
    let (tx, rx) = watch::channel(false);
    let ctx = ModuleCtx { service, shutdown: rx };

    let mut modules: Vec<Box<dyn Module>> =
        vec![Box::new(Housekeeper::new(cfg.scheduler.housekeeping_interval()))];
    #[cfg(feature = "web-api")]
    {
        let addr = cfg.listen.parse().with_context(|| format!("parse listen address {}", cfg.listen))?;
        modules.push(Box::new(web::WebServer::new(addr, cfg.api_key.clone())));
    }

    let mut handles = Vec::with_capacity(modules.len());
    for m in modules {
        let name = m.name();
        info!("starting module {name}");
        handles.push((name, m.spawn(ctx.clone())));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = tx.send(true);

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!("module {name} stopped"),
            Ok(Err(e)) => warn!("module {name} failed: {e:#}"),
            Err(e) => warn!("module {name} panicked: {e}"),
        }
    }
    Ok(())
}
