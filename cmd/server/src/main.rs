use std::sync::Arc;

use actix_web::{
    get, post,
    web::{Data, Json, Path, Query},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use kubevista_core::aggregator::Aggregator;
use kubevista_core::config::{RefreshConfig, SystemClock};
use kubevista_core::scope::ClusterId;
use kubevista_core::snapshot::BuildOptions;
use kubevista_core::telemetry;
use kubevista_k8s_util::client::new_client_with_metrics;
use prometheus_client::registry::Registry;
use serde::Deserialize;

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/metrics")]
async fn metrics(aggregator: Data<Arc<Aggregator>>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(aggregator.metrics().encode())
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    #[serde(default)]
    scope: String,
    #[serde(rename = "clusterId")]
    cluster_id: Option<String>,
}

/// Fetches one domain's snapshot. The conditional `If-None-Match` / `304`
/// path and the SSE stream endpoint are transport concerns this binary
/// leaves to whatever embeds this crate for a real deployment; this route
/// exists so the aggregator is reachable at all from outside the process
/// during local smoke testing.
#[get("/api/v2/snapshots/{domain}")]
async fn get_snapshot(
    aggregator: Data<Arc<Aggregator>>,
    path: Path<String>,
    query: Query<SnapshotQuery>,
) -> impl Responder {
    let domain = path.into_inner();
    let cluster_id = query.cluster_id.clone().map(ClusterId::new);
    let result = aggregator
        .snapshot(&domain, &query.scope, cluster_id, BuildOptions::default())
        .await;

    match result {
        Ok(by_cluster) => HttpResponse::Ok().json(
            by_cluster
                .into_iter()
                .map(|(cluster, outcome)| match outcome {
                    Ok(snapshot) => (cluster.to_string(), serde_json::json!({ "ok": true, "snapshot": snapshot })),
                    Err(e) => (cluster.to_string(), serde_json::json!({ "ok": false, "error": e.to_string() })),
                })
                .collect::<std::collections::HashMap<_, _>>(),
        ),
        Err(e) => HttpResponse::build(
            actix_web::http::StatusCode::from_u16(e.http_status_hint()).unwrap_or(actix_web::http::StatusCode::BAD_REQUEST),
        )
        .json(serde_json::json!({ "error": e.to_string() })),
    }
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    scope: String,
    #[serde(rename = "clusterId")]
    cluster_id: String,
}

#[post("/api/v2/refresh/{domain}")]
async fn post_refresh(
    aggregator: Data<Arc<Aggregator>>,
    path: Path<String>,
    body: Json<RefreshBody>,
) -> impl Responder {
    let domain = path.into_inner();
    let cluster_id = ClusterId::new(body.cluster_id.clone());
    match aggregator.subsystem(&cluster_id).await {
        Some(subsystem) => {
            let scope = match kubevista_core::scope::Scope::parse(&body.scope) {
                Ok(scope) => scope,
                Err(e) => return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() })),
            };
            let job_id = subsystem.submit_manual_refresh(&domain, scope).await;
            HttpResponse::Ok().json(serde_json::json!({ "jobId": job_id }))
        }
        None => HttpResponse::NotFound().json(serde_json::json!({ "error": "cluster not active" })),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "kubevista-server",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,kubevista=debug"
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

    /// Stable `<source>:<context>` identifier for the cluster this process
    /// refreshes. Kubeconfig discovery and multi-cluster bootstrapping are
    /// the embedding application's responsibility; this binary only ever
    /// starts one cluster subsystem from the ambient kube config.
    #[arg(long, default_value = "default:current", env = "KUBEVISTA_CLUSTER_ID")]
    cluster_id: String,

    /// Whether a metrics-server-backed metrics API is expected to be
    /// available on this cluster. When false, `cluster-overview` reports
    /// zero CPU/memory usage instead of erroring.
    #[arg(long, default_value_t = true, env = "KUBEVISTA_METRICS_AVAILABLE")]
    metrics_available: bool,
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

    let mut registry = Registry::with_prefix("kubevista");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;

    let metrics = Arc::new(kubevista_core::metrics::Metrics::with_registry(registry));
    let refresh_config = RefreshConfig::default();
    let aggregator = Arc::new(Aggregator::with_metrics(refresh_config, Arc::new(SystemClock), metrics));

    let cluster_id = ClusterId::new(args.cluster_id.clone());
    aggregator
        .add_cluster(cluster_id.clone(), client, args.metrics_available)
        .await;
    tracing::info!(cluster = %cluster_id, "cluster subsystem started");

    let server = HttpServer::new({
        let aggregator = aggregator.clone();
        move || {
            App::new()
                .app_data(Data::new(aggregator.clone()))
                .wrap(actix_web::middleware::Logger::default().exclude("/health"))
                .service(health)
                .service(metrics)
                .service(get_snapshot)
                .service(post_refresh)
        }
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    let result = server.run().await;
    aggregator.remove_cluster(&cluster_id).await;
    result?;
    Ok(())
}
