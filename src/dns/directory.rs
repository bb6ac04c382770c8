use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;

use async_trait::async_trait;
use itertools::Itertools;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::Api;
use tap::TapFallible;
use tracing::{debug, error, info, instrument, warn};

use crate::snapshot::Scheme;

const SCHEME_ANNOTATION: &str = "service.beta.kubernetes.io/aws-load-balancer-scheme";
const INTERNAL_ANNOTATION: &str = "service.beta.kubernetes.io/aws-load-balancer-internal";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoadBalancer {
    pub name: String,
    pub dns_name: String,
    pub scheme: Scheme,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, dns_name: impl Into<String>, scheme: Scheme) -> Self {
        Self {
            name: name.into(),
            dns_name: dns_name.into(),
            scheme,
        }
    }
}

/// Load balancers carrying one alias label value, at most one per scheme.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LoadBalancers {
    by_scheme: BTreeMap<Scheme, LoadBalancer>,
}

impl LoadBalancers {
    /// Group by scheme, more than one load balancer for a scheme is an ambiguous target.
    pub fn group(load_balancers: impl IntoIterator<Item = LoadBalancer>) -> anyhow::Result<Self> {
        let grouped: HashMap<Scheme, Vec<LoadBalancer>> = load_balancers
            .into_iter()
            .into_group_map_by(|load_balancer| load_balancer.scheme);

        let mut by_scheme = BTreeMap::new();

        for (scheme, mut group) in grouped {
            if group.len() > 1 {
                let names = group.iter().map(|load_balancer| &load_balancer.name).join(", ");

                return Err(anyhow::anyhow!(
                    "found {} {} load balancers: {}",
                    group.len(),
                    scheme,
                    names
                ));
            }

            if let Some(load_balancer) = group.pop() {
                by_scheme.insert(scheme, load_balancer);
            }
        }

        Ok(Self { by_scheme })
    }

    pub fn get(&self, scheme: Scheme) -> Option<&LoadBalancer> {
        self.by_scheme.get(&scheme)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadBalancer> {
        self.by_scheme.values()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scheme.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_scheme.len()
    }
}

/// Finds the load balancers traffic for the managed zone goes through.
#[async_trait]
pub trait LoadBalancerDirectory: Send + Sync {
    async fn find(&self, label_value: &str) -> anyhow::Result<LoadBalancers>;
}

#[async_trait]
impl<D, T> LoadBalancerDirectory for T
where
    T: Deref<Target = D> + Send + Sync,
    D: LoadBalancerDirectory + ?Sized,
{
    async fn find(&self, label_value: &str) -> anyhow::Result<LoadBalancers> {
        self.deref().find(label_value).await
    }
}

/// Directory backed by the cluster's `LoadBalancer` services.
#[derive(Clone)]
pub struct ServiceDirectory {
    api: Api<Service>,
    label_key: String,
}

impl ServiceDirectory {
    pub fn new(api: Api<Service>, label_key: impl Into<String>) -> Self {
        Self {
            api,
            label_key: label_key.into(),
        }
    }
}

#[async_trait]
impl LoadBalancerDirectory for ServiceDirectory {
    #[instrument(err, skip(self), fields(label_key = %self.label_key))]
    async fn find(&self, label_value: &str) -> anyhow::Result<LoadBalancers> {
        let list_params = ListParams::default().labels(&format!("{}={}", self.label_key, label_value));

        let services = self
            .api
            .list(&list_params)
            .await
            .tap_err(|err| error!(%err, "list load balancer services failed"))?;

        let load_balancers = services
            .items
            .iter()
            .filter_map(service_load_balancer)
            .collect::<Vec<_>>();

        info!(?load_balancers, "find load balancers done");

        LoadBalancers::group(load_balancers)
    }
}

/// Turn a `LoadBalancer` service with an assigned address into a [`LoadBalancer`].
pub fn service_load_balancer(service: &Service) -> Option<LoadBalancer> {
    let name = service.metadata.name.clone().unwrap_or_default();

    let is_lb_svc = service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .map(|svc_type| svc_type == "LoadBalancer")
        .unwrap_or(false);

    if !is_lb_svc {
        debug!(%name, "ignore non load balancer service");

        return None;
    }

    let dns_name = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb_status| lb_status.ingress.as_ref())
        .and_then(|ingress| {
            ingress.iter().find_map(|ingress| {
                ingress
                    .hostname
                    .clone()
                    .or_else(|| ingress.ip.clone())
                    .filter(|address| !address.is_empty())
            })
        });

    let dns_name = match dns_name {
        None => {
            warn!(%name, "load balancer service has no address yet");

            return None;
        }

        Some(dns_name) => dns_name,
    };

    Some(LoadBalancer {
        name,
        dns_name,
        scheme: service_scheme(service),
    })
}

fn service_scheme(service: &Service) -> Scheme {
    let annotations = match service.metadata.annotations.as_ref() {
        None => return Scheme::InternetFacing,
        Some(annotations) => annotations,
    };

    if let Some(scheme) = annotations.get(SCHEME_ANNOTATION) {
        if let Ok(scheme) = scheme.parse() {
            return scheme;
        }

        warn!(%scheme, "unknown load balancer scheme annotation, fall back to internet-facing");
    }

    match annotations.get(INTERNAL_ANNOTATION).map(|value| value.trim()) {
        Some("true") | Some("0.0.0.0/0") => Scheme::Internal,
        _ => Scheme::InternetFacing,
    }
}
