use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::dns::{AliasTargetOwnership, OwnershipKind, OwnershipPolicy, SuffixOwnership};
use crate::error::Error;
use crate::metrics::PushConfig;
use crate::snapshot::Scheme;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Keep DNS alias records in sync with the cluster ingresses")]
pub struct Args {
    #[clap(long, env = "DNS_ZONE", help = "DNS zone to manage, e.g. example.com")]
    zone: Option<String>,

    #[clap(
        long,
        env = "LB_LABEL_VALUE",
        help = "Alias label value of the load balancers to point records at"
    )]
    lb_label_value: Option<String>,

    #[clap(
        long,
        env = "LB_LABEL_KEY",
        help = "Alias label key of the load balancer services",
        default_value = "ingress-dns.io/frontend"
    )]
    lb_label_key: String,

    #[clap(
        long,
        help = "Scheme of ingresses without a scheme annotation (internal or internet-facing)",
        default_value = "internal"
    )]
    default_scheme: String,

    #[clap(
        long,
        help = "Which records may be deleted (alias-target or suffix)",
        default_value = "alias-target"
    )]
    ownership: String,

    #[clap(long, help = "Managed sub-domain, required by the suffix ownership")]
    owned_suffix: Option<String>,

    #[clap(long, help = "Port of the health and metrics endpoints", default_value_t = 12082)]
    health_port: u16,

    #[clap(
        long,
        help = "Reconcile interval when nothing changes",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    resync_interval: Duration,

    #[clap(
        long,
        help = "Deadline of one update call",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    update_deadline: Duration,

    #[clap(
        long,
        help = "How long to wait for a graceful stop after a termination signal",
        default_value = "20s",
        value_parser = humantime::parse_duration
    )]
    shutdown_grace: Duration,

    #[clap(
        long,
        help = "How often the unhealthy time is sampled",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    unhealthy_sample_interval: Duration,

    #[clap(
        long,
        env = "PUSHGATEWAY_URL",
        help = "Prometheus pushgateway URL to push metrics to, metrics aren't pushed when unset"
    )]
    pushgateway: Option<String>,

    #[clap(
        long,
        help = "How often metrics are pushed to the pushgateway",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pushgateway_interval: Duration,

    #[clap(long, help = "Enable debug logging")]
    pub debug: bool,
}

/// Validated settings of one agent run.
#[derive(Debug, Clone)]
pub struct Config {
    pub zone: String,
    pub label_key: String,
    pub label_value: String,
    pub default_scheme: Scheme,
    pub ownership: OwnershipKind,
    pub owned_suffix: Option<String>,
    pub health_addr: SocketAddr,
    pub resync_interval: Duration,
    pub update_deadline: Duration,
    pub shutdown_grace: Duration,
    pub unhealthy_sample_interval: Duration,
    pub pushgateway: Option<PushConfig>,
    pub debug: bool,
}

impl Args {
    pub fn validate(self) -> Result<Config, Error> {
        let zone = required(self.zone, "zone")?;
        let label_value = required(self.lb_label_value, "lb-label-value")?;

        if self.lb_label_key.trim().is_empty() {
            return Err(Error::construction("--lb-label-key must not be empty"));
        }

        let default_scheme = self
            .default_scheme
            .parse()
            .map_err(|err| Error::construction(format!("--default-scheme: {}", err)))?;

        let ownership = self
            .ownership
            .parse()
            .map_err(|err| Error::construction(format!("--ownership: {}", err)))?;

        let owned_suffix = self.owned_suffix.filter(|suffix| !suffix.trim().is_empty());

        if ownership == OwnershipKind::Suffix && owned_suffix.is_none() {
            return Err(Error::construction(
                "--owned-suffix is required by the suffix ownership",
            ));
        }

        for (flag, duration) in [
            ("resync-interval", self.resync_interval),
            ("update-deadline", self.update_deadline),
            ("unhealthy-sample-interval", self.unhealthy_sample_interval),
        ] {
            if duration.is_zero() {
                return Err(Error::construction(format!("--{} must be positive", flag)));
            }
        }

        let pushgateway = self
            .pushgateway
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .map(|url| PushConfig {
                url,
                interval: self.pushgateway_interval,
            });

        if pushgateway.is_some() && self.pushgateway_interval.is_zero() {
            return Err(Error::construction("--pushgateway-interval must be positive"));
        }

        Ok(Config {
            zone,
            label_key: self.lb_label_key,
            label_value,
            default_scheme,
            ownership,
            owned_suffix,
            health_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.health_port)),
            resync_interval: self.resync_interval,
            update_deadline: self.update_deadline,
            shutdown_grace: self.shutdown_grace,
            unhealthy_sample_interval: self.unhealthy_sample_interval,
            pushgateway,
            debug: self.debug,
        })
    }
}

impl Config {
    pub fn ownership_policy(&self) -> Box<dyn OwnershipPolicy> {
        match (self.ownership, &self.owned_suffix) {
            (OwnershipKind::Suffix, Some(suffix)) => Box::new(SuffixOwnership::new(suffix)),

            _ => Box::new(AliasTargetOwnership),
        }
    }
}

fn required(value: Option<String>, flag: &str) -> Result<String, Error> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::construction(format!("must supply --{}", flag)))
}
