use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harbor_orchestrator::router::{api, proxy, tls};
use harbor_orchestrator::runtime::DockerRuntime;
use harbor_orchestrator::{settings, Orchestrator, Settings};
use log::{error, info};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "harbord")]
#[command(about = "Single-host service orchestrator")]
struct Cli {
    /// Settings file (TOML, YAML or JSON); HARBOR_* environment variables override it
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router and the control-plane API
    Serve,
    /// Deploy the services file and print progress
    Deploy,
    /// List past deployments
    List,
    /// Verify the registry credentials used by the services file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = Settings::load(cli.settings.as_deref()).context("Failed to load settings")?;
    let config = settings::load_services(&settings.services_file)
        .with_context(|| format!("Failed to load {}", settings.services_file.display()))?;
    let runtime = Arc::new(DockerRuntime::connect()?);
    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        &config.control_plane().host,
        runtime,
    )?);

    match cli.command {
        Commands::Serve => serve(orchestrator).await,
        Commands::Deploy => {
            let mut handle = orchestrator.deploy(config);
            while let Some(event) = handle.events.recv().await {
                println!("{}", event);
            }
            match handle.task.await? {
                Ok(manifest) => {
                    println!("Deployment {} succeeded", manifest.id());
                    Ok(())
                }
                Err(e) => bail!("Deployment {} failed: {}", handle.id, e),
            }
        }
        Commands::List => {
            for summary in orchestrator.list()? {
                let outcome = if summary.outcome.is_success() { "ok" } else { "failed" };
                println!(
                    "{}  {}  {:<6}  {}",
                    summary.id,
                    summary.created_at.format("%Y-%m-%d %H:%M:%S"),
                    outcome,
                    summary.services.join(",")
                );
            }
            Ok(())
        }
        Commands::Check => {
            let mut failed = 0;
            for (auth, result) in orchestrator.check_registries(&config).await {
                match result {
                    Ok(()) => println!("{}: ok", auth.server),
                    Err(e) => {
                        failed += 1;
                        println!("{}: {}", auth.server, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} registry login(s) failed", failed);
            }
            Ok(())
        }
    }
}

async fn serve(orchestrator: Arc<Orchestrator>) -> Result<()> {
    info!("=== harbord starting ===");
    if let Some(id) = orchestrator.restore()? {
        info!("Routing to deployment {}", id);
    }
    // `harbord deploy` runs as a separate process; its manifests arrive through the store.
    let _watcher = orchestrator.watch_store(orchestrator.settings().store_poll_interval());

    let router = Arc::clone(orchestrator.router());
    let app = proxy::front(Arc::clone(&router), api::routes(Arc::clone(&orchestrator)));
    let listen = orchestrator.settings().listen_addr.clone();

    let http_addr: SocketAddr = format!("{}:{}", listen, orchestrator.settings().http_port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;
    info!("HTTP listening on {}", http_addr);
    let http = axum::serve(listener, app.clone()).into_future();

    let Some(email) = orchestrator.settings().acme_email.clone() else {
        info!("No ACME contact configured, HTTPS disabled");
        http.await?;
        return Ok(());
    };

    let https_addr: SocketAddr = format!("{}:{}", listen, orchestrator.settings().https_port)
        .parse()
        .context("Invalid listen address")?;
    let acme = tls::AcmeSettings {
        contact_email: email,
        cache_dir: orchestrator.settings().certs_dir(),
        production: orchestrator.settings().acme_production,
    };
    let https = tls::serve_https(https_addr, app, &router, acme);

    tokio::select! {
        result = http => {
            if let Err(e) = &result {
                error!("HTTP server stopped: {}", e);
            }
            result?;
        }
        result = https => {
            if let Err(e) = &result {
                error!("HTTPS server stopped: {}", e);
            }
            result?;
        }
    }
    Ok(())
}
