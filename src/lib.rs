use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use tracing::{error, info};

pub use error::Error;

use crate::config::Args;
use crate::controller::{Controller, ControllerConfig};
use crate::dns::{CfDns, DnsConfig, DnsUpdater, ServiceDirectory};
use crate::metrics::Metrics;
use crate::probe::ProbeServer;
use crate::signal::Termination;
use crate::watch::IngressOptions;

pub mod config;
pub mod controller;
pub mod dns;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod probe;
pub mod signal;
pub mod snapshot;
mod trace;
pub mod watch;

pub async fn run() -> Result<()> {
    let args = Args::parse();

    trace::init_tracing(args.debug)?;

    let result = run_agent(args).await;
    if let Err(err) = &result {
        error!(%err, "ingress-dns failed");
    }

    trace::stop_tracing();

    result
}

async fn run_agent(args: Args) -> Result<()> {
    let config = args.validate()?;

    info!(?config, "starting ingress-dns");

    let credentials = dns::credentials_from_env().ok_or_else(|| {
        Error::construction("can't find cloudflare (CF_DNS_EMAIL, CF_DNS_KEY) or CF_DNS_TOKEN")
    })?;

    let provider = CfDns::new(credentials)
        .map_err(|err| Error::construction(format!("create cloudflare client: {}", err)))?;

    let metrics = Arc::new(Metrics::new()?);

    let client = Client::try_default().await?;

    let directory = ServiceDirectory::new(Api::<Service>::all(client.clone()), &config.label_key);

    let feed = watch::spawn_ingress_watch(
        Api::<Ingress>::all(client),
        IngressOptions {
            default_scheme: config.default_scheme,
            default_label: config.label_value.clone(),
        },
    );

    let dns_updater = DnsUpdater::new(
        DnsConfig {
            zone: config.zone.clone(),
            label_value: config.label_value.clone(),
        },
        provider,
        directory,
        config.ownership_policy(),
    )?
    .with_metrics(metrics.clone());

    let controller = Controller::new(ControllerConfig {
        feed,
        updaters: vec![Arc::new(dns_updater)],
        update_deadline: config.update_deadline,
        resync_interval: config.resync_interval,
    })?
    .with_metrics(metrics.clone());
    let controller = Arc::new(controller);

    let termination = Termination::install()?;

    let probe = ProbeServer::serve(config.health_addr, controller.clone(), metrics.clone()).await?;

    if let Err(err) = controller.start().await {
        probe.shutdown().await;

        return Err(err.into());
    }

    let sampler = metrics::spawn_unhealthy_sampler(
        controller.clone(),
        metrics.clone(),
        config.unhealthy_sample_interval,
    );

    let pusher = config
        .pushgateway
        .clone()
        .map(|push| metrics::spawn_metrics_pusher(metrics.clone(), push));

    let result = termination
        .shutdown(&controller, config.shutdown_grace)
        .await;

    sampler.abort();
    probe.shutdown().await;

    if let (Some(pusher), Some(push)) = (pusher, &config.pushgateway) {
        pusher.abort();

        // push the final samples
        if let Err(err) = metrics::push_metrics(metrics, &push.url).await {
            error!(%err, "final metrics push failed");
        }
    }

    let signal = result?;

    info!(%signal, "ingress-dns stopped");

    Ok(())
}
