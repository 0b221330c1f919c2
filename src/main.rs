use cachefront::app::App;
use cachefront::cache::Cache;
use cachefront::diagnostics;
use cachefront::logging;
use cachefront::metrics;
use cachefront::proxy::CacheProxy;
use cachefront::Config;
use clap::Parser;
use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use log::{debug, error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "cachefront", about = "A small caching HTTP reverse proxy", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = logging::init_from_env() {
        eprintln!("{e}");
        process::exit(1);
    }
    metrics::init();

    let raw = match std::fs::read_to_string(&args.config) {
        Ok(raw) => raw,
        Err(e) => {
            error!("cant read config {}: {e}", args.config.display());
            process::exit(1);
        }
    };
    let config = match Config::parse(&raw) {
        Ok(config) => config,
        Err(e) => {
            error!("cant parse config: {e}");
            process::exit(1);
        }
    };

    // the User build calls below cannot fail after validation, but keep
    // the error path honest anyway
    let built = (|| {
        Ok::<_, cachefront::ProxyError>((
            config.can_persist_cache.build()?,
            config.can_load_cache.build()?,
            config.can_force_emit_debug_logging.build()?,
            config.ordered_cache_control_fallback.build()?,
        ))
    })();
    let (can_persist, can_load, force_debug, resolver) = match built {
        Ok(built) => built,
        Err(e) => {
            error!("cant build config: {e}");
            process::exit(1);
        }
    };
    info!("can persist cache config:\n{can_persist}");
    info!("can load cache config:\n{can_load}");
    info!("can force emit debug logging config:\n{force_debug}");

    if args.check_config {
        info!("check-config is set, config is valid");
        return;
    }

    let cache: Arc<dyn Cache> = match config.cache.build() {
        Ok(cache) => cache,
        Err(e) => {
            error!("cant build cache: {e}");
            process::exit(1);
        }
    };
    let listen_addr = config.listen_addr().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    let diagnostic_addr = config.diagnostic_addr().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let upstream = Arc::new(config.upstream.build());
    let proxy = CacheProxy::new(
        can_persist,
        can_load,
        config.cache_key_config,
        upstream,
        Arc::clone(&cache),
        resolver,
    );
    let app = Arc::new(App::new(proxy, force_debug));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    debug!("starting main server");
    let mut main_server = spawn_main_server(listen_addr, app, shutdown_rx.clone());
    // the diagnostic listener comes up after the main one is serving
    let mut diagnostic_server = spawn_diagnostic_server(diagnostic_addr, cache, shutdown_rx);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let (main_result, diagnostic_result) = tokio::join!(main_server, diagnostic_server);
            check_server("main", main_result);
            check_server("diagnostic", diagnostic_result);
        }
        result = &mut main_server => {
            check_server("main", result);
            let _ = shutdown_tx.send(true);
            let _ = diagnostic_server.await;
        }
        result = &mut diagnostic_server => {
            check_server("diagnostic", result);
            let _ = shutdown_tx.send(true);
            let _ = main_server.await;
        }
    }
    info!("good bye");
}

type ServerResult = Result<(), hyper::Error>;

fn spawn_main_server(
    addr: SocketAddr,
    app: Arc<App>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<ServerResult> {
    tokio::spawn(async move {
        let service = make_service_fn(move |_conn| {
            let app = Arc::clone(&app);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let app = Arc::clone(&app);
                    async move { Ok::<_, Infallible>(app.handle(request).await) }
                }))
            }
        });
        Server::try_bind(&addr)?
            .serve(service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    })
}

fn spawn_diagnostic_server(
    addr: SocketAddr,
    cache: Arc<dyn Cache>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<ServerResult> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        debug!("starting diagnostic server");
        let service = make_service_fn(move |_conn| {
            let cache = Arc::clone(&cache);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let cache = Arc::clone(&cache);
                    async move { Ok::<_, Infallible>(diagnostics::handle(cache, request).await) }
                }))
            }
        });
        Server::try_bind(&addr)?
            .serve(service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    })
}

/// A server task that ends with an error takes the whole process down;
/// a clean end (graceful shutdown) is fine.
fn check_server(name: &str, result: Result<ServerResult, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("on listen {name} server: {e}");
            process::exit(1);
        }
        Err(e) => {
            error!("{name} server task failed: {e}");
            process::exit(1);
        }
    }
}
