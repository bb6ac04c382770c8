//! Prometheus metrics, exposed on `/metrics` by the probe server and optionally pushed to a
//! pushgateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::controller::Controller;

const NAMESPACE: &str = "ingress_dns";
const PUSH_JOB: &str = "ingress-dns";

/// Pushgateway the metrics are pushed to every `interval`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PushConfig {
    pub url: String,
    pub interval: Duration,
}

pub struct Metrics {
    registry: Registry,
    unhealthy_seconds: Counter,
    unhealthy_duration: Gauge,
    cycles: CounterVec,
    cycle_duration: Histogram,
    updater_failures: CounterVec,
    record_changes: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let unhealthy_seconds = Counter::with_opts(
            Opts::new(
                "unhealthy_seconds_total",
                "The number of seconds the agent has been unhealthy",
            )
            .namespace(NAMESPACE),
        )?;

        let unhealthy_duration = Gauge::with_opts(
            Opts::new(
                "unhealthy_duration_seconds",
                "How long the agent has been unhealthy without interruption",
            )
            .namespace(NAMESPACE),
        )?;

        let cycles = CounterVec::new(
            Opts::new("cycles_total", "Reconcile cycles by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Duration of reconcile cycles")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;

        let updater_failures = CounterVec::new(
            Opts::new("updater_failures_total", "Failed update calls by updater")
                .namespace(NAMESPACE),
            &["updater"],
        )?;

        let record_changes = CounterVec::new(
            Opts::new("record_changes_total", "DNS record changes sent to the provider")
                .namespace(NAMESPACE),
            &["action"],
        )?;

        registry.register(Box::new(unhealthy_seconds.clone()))?;
        registry.register(Box::new(unhealthy_duration.clone()))?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(updater_failures.clone()))?;
        registry.register(Box::new(record_changes.clone()))?;

        Ok(Self {
            registry,
            unhealthy_seconds,
            unhealthy_duration,
            cycles,
            cycle_duration,
            updater_failures,
            record_changes,
        })
    }

    pub fn observe_cycle(&self, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };

        self.cycles.with_label_values(&[outcome]).inc();
        self.cycle_duration.observe(elapsed.as_secs_f64());
    }

    pub fn updater_failed(&self, updater: &str) {
        self.updater_failures.with_label_values(&[updater]).inc();
    }

    pub fn record_changes(&self, upserts: usize, deletes: usize) {
        self.record_changes
            .with_label_values(&["upsert"])
            .inc_by(upserts as f64);
        self.record_changes
            .with_label_values(&["delete"])
            .inc_by(deletes as f64);
    }

    /// Account one sampling tick of `interval`, given how long the agent is unhealthy.
    pub fn sample_unhealthy(&self, unhealthy_for: Duration, interval: Duration) {
        self.unhealthy_duration.set(unhealthy_for.as_secs_f64());

        if !unhealthy_for.is_zero() {
            self.unhealthy_seconds.inc_by(interval.as_secs_f64());
        }
    }

    /// Encode every metric in the Prometheus text format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buffer = vec![];

        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    /// Replace the metrics of our job on the pushgateway at `url`, blocks until it answers.
    pub fn push(&self, url: &str) -> Result<(), prometheus::Error> {
        prometheus::push_metrics(PUSH_JOB, HashMap::new(), url, self.registry.gather(), None)
    }
}

/// Push the metrics every `push.interval` until the returned task is aborted.
pub fn spawn_metrics_pusher(metrics: Arc<Metrics>, push: PushConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + push.interval, push.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(err) = push_metrics(metrics.clone(), &push.url).await {
                warn!(%err, url = %push.url, "push metrics failed");
            }
        }
    })
}

/// Push the metrics once, off the runtime threads.
pub async fn push_metrics(metrics: Arc<Metrics>, url: &str) -> anyhow::Result<()> {
    let push_url = url.to_string();

    task::spawn_blocking(move || metrics.push(&push_url))
        .await
        .map_err(|err| {
            error!(%err, "push metrics task failed");

            anyhow::anyhow!("push metrics task failed: {}", err)
        })??;

    debug!(url, "push metrics done");

    Ok(())
}

/// Sample the controller health every `interval` until the returned task is aborted.
pub fn spawn_unhealthy_sampler(
    controller: Arc<Controller>,
    metrics: Arc<Metrics>,
    interval: Duration,
) -> JoinHandle<()> {
    spawn_sampler(move || controller.health().unhealthy_for(), metrics, interval)
}

fn spawn_sampler<F>(sample: F, metrics: Arc<Metrics>, interval: Duration) -> JoinHandle<()>
where
    F: Fn() -> Duration + Send + 'static,
{
    tokio::spawn(async move {
        // the first sample covers a whole interval
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let unhealthy_for = sample();

            metrics.sample_unhealthy(unhealthy_for, interval);

            if unhealthy_for.is_zero() {
                debug!("controller is healthy");
            } else {
                warn!(?unhealthy_for, "controller is unhealthy");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Bytes;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::put;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn gather_contains_all_families() {
        let metrics = Metrics::new().unwrap();

        metrics.observe_cycle(true, Duration::from_millis(20));
        metrics.updater_failed("dns");
        metrics.record_changes(2, 1);
        metrics.sample_unhealthy(Duration::from_secs(3), Duration::from_secs(1));

        let text = metrics.gather().unwrap();

        assert!(text.contains("ingress_dns_unhealthy_seconds_total 1"));
        assert!(text.contains("ingress_dns_unhealthy_duration_seconds 3"));
        assert!(text.contains(r#"ingress_dns_cycles_total{outcome="success"} 1"#));
        assert!(text.contains("ingress_dns_cycle_duration_seconds_count 1"));
        assert!(text.contains(r#"ingress_dns_updater_failures_total{updater="dns"} 1"#));
        assert!(text.contains(r#"ingress_dns_record_changes_total{action="upsert"} 2"#));
        assert!(text.contains(r#"ingress_dns_record_changes_total{action="delete"} 1"#));
    }

    #[test]
    fn healthy_sample_does_not_count() {
        let metrics = Metrics::new().unwrap();

        metrics.sample_unhealthy(Duration::ZERO, Duration::from_secs(1));
        metrics.sample_unhealthy(Duration::from_secs(2), Duration::from_secs(1));
        metrics.sample_unhealthy(Duration::ZERO, Duration::from_secs(1));

        assert_eq!(metrics.unhealthy_seconds.get(), 1.0);
        assert_eq!(metrics.unhealthy_duration.get(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_waits_one_interval() {
        let metrics = Arc::new(Metrics::new().unwrap());

        let sampler = spawn_sampler(
            || Duration::from_secs(5),
            metrics.clone(),
            Duration::from_secs(1),
        );

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.unhealthy_seconds.get(), 0.0);

        time::advance(Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.unhealthy_seconds.get(), 1.0);
        assert_eq!(metrics.unhealthy_duration.get(), 5.0);

        sampler.abort();
    }

    async fn serve_pushgateway() -> (String, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let pushed = Arc::new(Mutex::new(vec![]));

        let app = Router::new().route(
            "/metrics/job/{job}",
            put({
                let pushed = pushed.clone();

                move |Path(job): Path<String>, body: Bytes| async move {
                    pushed.lock().unwrap().push((job, body.to_vec()));

                    StatusCode::ACCEPTED
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move { axum::serve(listener, app).await });

        (format!("http://{}", addr), pushed)
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }

    #[tokio::test]
    async fn push_to_pushgateway() {
        let (url, pushed) = serve_pushgateway().await;

        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.sample_unhealthy(Duration::from_secs(2), Duration::from_secs(1));

        push_metrics(metrics, &url).await.unwrap();

        let pushed = pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "ingress-dns");
        assert!(contains(&pushed[0].1, "ingress_dns_unhealthy_seconds_total"));
    }

    #[tokio::test]
    async fn pusher_pushes_every_interval() {
        let (url, pushed) = serve_pushgateway().await;

        let pusher = spawn_metrics_pusher(
            Arc::new(Metrics::new().unwrap()),
            PushConfig {
                url,
                interval: Duration::from_millis(50),
            },
        );

        time::timeout(Duration::from_secs(5), async {
            while pushed.lock().unwrap().len() < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pusher.abort();
    }

    #[tokio::test]
    async fn unreachable_pushgateway_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = push_metrics(Arc::new(Metrics::new().unwrap()), &format!("http://{}", addr)).await;

        assert!(result.is_err());
    }

    #[test]
    fn registries_are_independent() {
        // each instance owns its registry, so building twice never collides
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.updater_failed("dns");

        assert!(!second.gather().unwrap().contains("updater=\"dns\""));
    }
}
