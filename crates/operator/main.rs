use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use rac_database::controllers::racdatabase_controller::{self, State};
use rac_database::util::config::OperatorConfig;
use rac_database::util::poll::PollConfig;
use rac_database::util::telemetry;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Kubernetes operator for Oracle RAC databases on ASM block devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics, health and diagnostics bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Maximum number of databases reconciled in parallel
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 100)]
    max_concurrent_reconciles: u16,

    /// Seconds to wait for the disk probe DaemonSet to become ready
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = 120)]
    probe_timeout_secs: u64,

    /// Seconds to wait for a StatefulSet rollout after a device change
    #[arg(long, env = "ROLLOUT_TIMEOUT_SECS", default_value_t = 900)]
    rollout_timeout_secs: u64,

    /// Requeue delay after a completed pass
    #[arg(long, env = "SUCCESS_REQUEUE_SECS", default_value_t = 60)]
    success_requeue_secs: u64,

    /// Requeue delay after a blocked or failed pass
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 300)]
    error_requeue_secs: u64,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let defaults = OperatorConfig::default();
        OperatorConfig {
            probe_ready: PollConfig::new(
                defaults.probe_ready.interval,
                Duration::from_secs(self.probe_timeout_secs),
            ),
            rollout: PollConfig::new(defaults.rollout.interval, Duration::from_secs(self.rollout_timeout_secs)),
            success_requeue: Duration::from_secs(self.success_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            ..defaults
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_json).map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    let config = args.operator_config();
    info!(?config, "starting rac database operator");

    // Initialize Kubernetes controller state
    let state = State::default();
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => error!("unable to listen for shutdown signal: {e}"),
        }
    });

    let controller_cancel = cancel.clone();
    let controller = racdatabase_controller::run(state.clone(), config, cancel.clone());
    let controller = async move {
        let res = controller.await;
        // A controller that cannot start takes the web server down with it
        controller_cancel.cancel();
        res
    };

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.metrics_addr)?
    .shutdown_timeout(5)
    .disable_signals()
    .run();
    let handle = server.handle();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        server_cancel.cancelled().await;
        handle.stop(true).await;
    });

    // Both sides shut down gracefully on the token, so poll until both are done
    let (controller_res, server_res) = tokio::join!(controller, server);
    if let Err(e) = &controller_res {
        error!("controller exited with error: {e}");
    }
    server_res?;
    controller_res?;
    Ok(())
}
