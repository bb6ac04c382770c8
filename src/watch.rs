use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::{Api, ResourceExt};
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::feed::{SnapshotFeed, SnapshotSender};
use crate::snapshot::{IngressEntry, IngressSnapshot, Scheme};

pub const SCHEME_ANNOTATION: &str = "ingress-dns.io/frontend-scheme";
pub const LABEL_ANNOTATION: &str = "ingress-dns.io/frontend-label";

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// How ingress resources without our annotations are interpreted.
#[derive(Debug, Clone)]
pub struct IngressOptions {
    pub default_scheme: Scheme,
    pub default_label: String,
}

/// Watch every ingress of the cluster and publish a snapshot whenever the requested hosts
/// change.
pub fn spawn_ingress_watch(api: Api<Ingress>, options: IngressOptions) -> SnapshotFeed {
    let (sender, feed) = SnapshotFeed::channel();

    let task = tokio::spawn(
        watch_ingresses(api, SnapshotPublisher::new(sender, options))
            .instrument(info_span!("ingress watch")),
    );

    feed.with_task(task)
}

async fn watch_ingresses(api: Api<Ingress>, mut publisher: SnapshotPublisher) {
    let mut events = watcher(api, ListParams::default()).boxed();

    while let Some(event) = events.next().await {
        match event {
            Err(err) => {
                error!(%err, "watch ingress failed, retry later");

                time::sleep(RETRY_DELAY).await;
            }

            Ok(event) => {
                publisher.handle(event);

                if publisher.is_closed() {
                    info!("snapshot receiver is gone, stop watching ingresses");

                    return;
                }
            }
        }
    }

    warn!("ingress watch stream ended");
}

/// Keeps the watched ingress set and turns it into versioned snapshots.
struct SnapshotPublisher {
    sender: SnapshotSender,
    options: IngressOptions,
    ingresses: BTreeMap<String, Vec<IngressEntry>>,
    version: u64,
}

impl SnapshotPublisher {
    fn new(sender: SnapshotSender, options: IngressOptions) -> Self {
        Self {
            sender,
            options,
            ingresses: BTreeMap::new(),
            version: 0,
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Apply one watch event, returns whether a new snapshot was published.
    fn handle(&mut self, event: Event<Ingress>) -> bool {
        match event {
            Event::Applied(ingress) => {
                let entries = ingress_entries(&ingress, &self.options);

                self.ingresses.insert(object_key(&ingress), entries);
            }

            Event::Deleted(ingress) => {
                self.ingresses.remove(&object_key(&ingress));
            }

            Event::Restarted(ingresses) => {
                info!(count = ingresses.len(), "ingress list restarted");

                self.ingresses = ingresses
                    .iter()
                    .map(|ingress| (object_key(ingress), ingress_entries(ingress, &self.options)))
                    .collect();

                // the first list marks the snapshot as synced even when it is empty
                if self.version == 0 {
                    return self.publish(self.entries());
                }
            }
        }

        // applied or deleted before the first list can't happen with a watcher, but an
        // unsynced view must never be published
        if self.version == 0 {
            return false;
        }

        let entries = self.entries();

        if self.sender.borrow().same_entries(&entries) {
            debug!("ingress hosts unchanged");

            return false;
        }

        self.publish(entries)
    }

    fn entries(&self) -> BTreeSet<IngressEntry> {
        self.ingresses.values().flatten().cloned().collect()
    }

    fn publish(&mut self, entries: BTreeSet<IngressEntry>) -> bool {
        self.version += 1;

        let snapshot = IngressSnapshot::new(self.version, entries);

        info!(version = self.version, entries = snapshot.len(), "publish ingress snapshot");

        // a closed channel is noticed by the watch loop
        self.sender.send(Arc::new(snapshot)).is_ok()
    }
}

fn object_key(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name()
    )
}

/// Hosts requested by `ingress`, none when its scheme annotation is invalid.
pub fn ingress_entries(ingress: &Ingress, options: &IngressOptions) -> Vec<IngressEntry> {
    let annotations = ingress.annotations();

    let scheme = match annotations.get(SCHEME_ANNOTATION) {
        None => options.default_scheme,

        Some(value) => match value.parse::<Scheme>() {
            Ok(scheme) => scheme,

            Err(err) => {
                warn!(ingress = %object_key(ingress), %err, "invalid scheme annotation, skip ingress");

                return vec![];
            }
        },
    };

    let label = annotations
        .get(LABEL_ANNOTATION)
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .unwrap_or(options.default_label.as_str());

    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .filter_map(|rule| rule.host.as_deref())
        .filter(|host| !host.is_empty())
        .map(|host| IngressEntry::new(host, scheme, label))
        .collect()
}
