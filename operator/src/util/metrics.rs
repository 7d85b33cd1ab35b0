use const_format::concatcp;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use lazy_static::lazy_static;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use std::convert::Infallible;
use tokio::net::TcpListener;

const NAMESPACE: &str = "stratus";

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("register collector");
    collector
}

lazy_static! {
    /// Process-wide registry, initialized exactly once.
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SCHEDULING_DURATION: Histogram = register(
        Histogram::with_opts(
            HistogramOpts::new(
                concatcp!(NAMESPACE, "_scheduling_duration_seconds"),
                "Wall time of one batch scheduling round.",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 14).unwrap()),
        )
        .unwrap()
    );

    pub static ref PODS_SCHEDULED: IntCounterVec = register(
        IntCounterVec::new(
            Opts::new(
                concatcp!(NAMESPACE, "_pods_scheduled_total"),
                "Pods handled per scheduling round, by decision.",
            ),
            &["decision"],
        )
        .unwrap()
    );

    pub static ref NODECLAIMS_CREATED: IntCounterVec = register(
        IntCounterVec::new(
            Opts::new(
                concatcp!(NAMESPACE, "_nodeclaims_created_total"),
                "NodeClaims committed to the cluster, by owning pool.",
            ),
            &["nodepool"],
        )
        .unwrap()
    );

    pub static ref NODECLAIMS_TERMINATED: IntCounterVec = register(
        IntCounterVec::new(
            Opts::new(
                concatcp!(NAMESPACE, "_nodeclaims_terminated_total"),
                "NodeClaims fully terminated, by reason.",
            ),
            &["reason"],
        )
        .unwrap()
    );

    pub static ref TERMINATION_DURATION: HistogramVec = register(
        HistogramVec::new(
            HistogramOpts::new(
                concatcp!(NAMESPACE, "_termination_duration_seconds"),
                "Wall time from deletion timestamp to finalizer removal.",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 16).unwrap()),
            &["reason"],
        )
        .unwrap()
    );

    pub static ref EVICTIONS: IntCounterVec = register(
        IntCounterVec::new(
            Opts::new(
                concatcp!(NAMESPACE, "_evictions_total"),
                "Pod evictions attempted during drain, by result.",
            ),
            &["result"],
        )
        .unwrap()
    );
}

/// Per-controller reconcile instrumentation.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        ControllerMetrics {
            reconcile_counter: register(
                IntCounterVec::new(
                    Opts::new(
                        format!("{}_{}_reconcile_total", NAMESPACE, controller),
                        "Total reconciliations for this controller.",
                    ),
                    &["name"],
                )
                .unwrap(),
            ),
            action_counter: register(
                IntCounterVec::new(
                    Opts::new(
                        format!("{}_{}_action_total", NAMESPACE, controller),
                        "Actions taken during reconciliation.",
                    ),
                    &["name", "action"],
                )
                .unwrap(),
            ),
            read_histogram: register(
                HistogramVec::new(
                    HistogramOpts::new(
                        format!("{}_{}_read_duration_seconds", NAMESPACE, controller),
                        "Duration of the read phase of reconciliation.",
                    ),
                    &["name", "action"],
                )
                .unwrap(),
            ),
            write_histogram: register(
                HistogramVec::new(
                    HistogramOpts::new(
                        format!("{}_{}_write_duration_seconds", NAMESPACE, controller),
                        "Duration of the write phase of reconciliation.",
                    ),
                    &["name", "action"],
                )
                .unwrap(),
            ),
        }
    }
}

async fn handle(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let metric_families = REGISTRY.gather();
            let mut buffer = Vec::new();
            TextEncoder::new()
                .encode(&metric_families, &mut buffer)
                .expect("encode metrics");
            Response::new(Full::new(Bytes::from(buffer)))
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::new()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

pub async fn run_metrics_server(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service_fn(handle))
                .await;
        });
    }
}
