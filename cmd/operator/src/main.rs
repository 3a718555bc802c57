use std::sync::Arc;
use std::time::Duration;

use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::{crate_authors, crate_description, crate_version, Parser};
use faro_core::config::EngineConfig;
use faro_core::engine::Engine;
use faro_core::metrics::{MetricsSink, PrometheusMetricsSink};
use faro_core::telemetry;
use faro_k8s_util::client::new_client_with_metrics;
use kube::Config;
use prometheus_client::registry::Registry;
use tokio::signal;
use tracing::info;

/// State shared between the HTTP server and the background engine:
/// the Prometheus registry for `/metrics` and a cheap `Engine` handle for
/// `/health`'s readiness check.
#[derive(Clone)]
struct State {
    registry: Arc<Registry>,
    engine: Engine,
}

impl State {
    fn metrics_text(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry).unwrap();
        buffer
    }
}

#[get("/metrics")]
async fn metrics(state: Data<State>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(state.metrics_text())
}

#[get("/health")]
async fn health(state: Data<State>, _req: HttpRequest) -> impl Responder {
    if state.engine.is_ready().await {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("starting")
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "faro",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,faro_core=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Path to the YAML configuration describing which resources to watch.
    #[arg(short, long, env)]
    config: String,

    /// Overrides the config's `outputDir` for the JSON event file.
    #[arg(long, env)]
    output_dir: Option<String>,

    /// Overrides the config's `jsonExport` flag, enabling the JSON sink.
    #[arg(long, env)]
    json_export: bool,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(&args.config)?;
    let mut config: EngineConfig = serde_yaml::from_str(&raw)?;
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if args.json_export {
        config.json_export = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let config = load_config(&args)?;
    let auto_shutdown_sec = config.auto_shutdown_sec;

    let mut registry = Registry::with_prefix("faro");
    let kube_config = Config::infer().await?;
    let client = new_client_with_metrics(kube_config, &mut registry).await?;
    let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusMetricsSink::default().register(&mut registry));

    let engine = Engine::new(client, config, sink).with_json_export().await?;
    engine
        .set_ready_callback(|| info!("faro engine ready"))
        .await;
    engine.start().await?;

    let state = State {
        registry: Arc::new(registry),
        engine: engine.clone(),
    };

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5)
    .run();

    let auto_shutdown = async {
        match auto_shutdown_sec {
            Some(secs) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                info!(secs, "auto shutdown timer elapsed");
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = server => { result?; }
        _ = signal::ctrl_c() => { info!("received shutdown signal"); }
        () = auto_shutdown => {}
    }

    engine.stop().await;
    Ok(())
}
