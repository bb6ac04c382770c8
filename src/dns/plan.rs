use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::dns::directory::LoadBalancers;
use crate::dns::provider::{normalize_name, ChangeBatch, Record, RecordKey, Upsert};
use crate::snapshot::{IngressSnapshot, Scheme};

/// Records the zone should contain for `snapshot`, aliases of the load balancer hostnames
/// or address records when a load balancer only has an IP address.
///
/// Only entries requiring `label_value` whose scheme has a load balancer are kept. Hosts
/// outside `zone` are skipped. A host requested with two schemes keeps the first one in
/// snapshot order.
pub fn desired_records(
    zone: &str,
    label_value: &str,
    snapshot: &IngressSnapshot,
    load_balancers: &LoadBalancers,
) -> Vec<Record> {
    let zone = normalize_name(zone);
    let mut desired: BTreeMap<String, (Scheme, Record)> = BTreeMap::new();

    for entry in snapshot.entries() {
        if entry.required_label != label_value {
            debug!(host = %entry.host, label = %entry.required_label, "entry is for another load balancer label");

            continue;
        }

        let host = normalize_name(&entry.host);

        if !in_zone(&host, &zone) {
            warn!(%host, %zone, "host is outside of the managed zone, skip it");

            continue;
        }

        let load_balancer = match load_balancers.get(entry.scheme) {
            None => {
                warn!(%host, scheme = %entry.scheme, "no load balancer for scheme, skip host");

                continue;
            }

            Some(load_balancer) => load_balancer,
        };

        if let Some((scheme, _)) = desired.get(&host) {
            if *scheme != entry.scheme {
                warn!(%host, kept = %scheme, ignored = %entry.scheme, "host is requested with conflicting schemes");
            }

            continue;
        }

        desired.insert(
            host.clone(),
            (entry.scheme, Record::pointing_at(host, &load_balancer.dns_name)),
        );
    }

    desired.into_values().map(|(_, record)| record).collect()
}

/// Changes turning `existing` into `desired`.
///
/// Desired records that are missing or point elsewhere are upserted. Existing records
/// missing from `desired` are deleted only when `owned` says so.
pub fn diff(
    desired: &[Record],
    existing: &[Record],
    owned: impl Fn(&Record) -> bool,
) -> ChangeBatch {
    let mut existing_by_key: HashMap<RecordKey, &Record> = HashMap::with_capacity(existing.len());
    for record in existing {
        existing_by_key.entry(record.key()).or_insert(record);
    }

    let desired_keys = desired.iter().map(Record::key).collect::<HashSet<_>>();

    let upserts = desired
        .iter()
        .filter_map(|record| match existing_by_key.get(&record.key()) {
            Some(current) if current.same_target(record) => None,

            current => Some(Upsert {
                record: record.clone(),
                existing: current.map(|current| (*current).clone()),
            }),
        })
        .collect();

    let deletes = existing
        .iter()
        .filter(|record| !desired_keys.contains(&record.key()) && owned(*record))
        .cloned()
        .collect();

    let batch = ChangeBatch { upserts, deletes };

    for (upsert, conflict) in conflicting_records(&batch, existing) {
        warn!(
            record = %upsert.record,
            conflict = %conflict,
            "conflicting record kind on the same name, the upsert will be rejected until it is removed"
        );
    }

    batch
}

/// Existing records of another kind sharing the name of a created record and kept by
/// `batch`. A name can't hold an alias next to other records.
pub(crate) fn conflicting_records<'a>(
    batch: &'a ChangeBatch,
    existing: &'a [Record],
) -> Vec<(&'a Upsert, &'a Record)> {
    let deleted = batch.deletes.iter().map(Record::key).collect::<HashSet<_>>();
    let deleted = &deleted;

    batch
        .upserts
        .iter()
        .filter(|upsert| upsert.existing.is_none())
        .flat_map(|upsert| {
            let name = normalize_name(&upsert.record.name);

            existing
                .iter()
                .filter(move |record| {
                    let key = record.key();

                    key.name == name
                        && key.kind != upsert.record.kind
                        && (upsert.record.is_alias() || record.is_alias())
                        && !deleted.contains(&key)
                })
                .map(move |record| (upsert, record))
        })
        .collect()
}

fn in_zone(host: &str, zone: &str) -> bool {
    host == zone
        || host
            .strip_suffix(zone)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::directory::LoadBalancer;
    use crate::dns::provider::RecordKind;
    use crate::snapshot::IngressEntry;

    const ZONE: &str = "example.com";
    const LABEL: &str = "frontend";

    fn load_balancers() -> LoadBalancers {
        LoadBalancers::group(vec![
            LoadBalancer::new("int", "lb-new.elb", Scheme::Internal),
            LoadBalancer::new("ext", "lb-ext.elb", Scheme::InternetFacing),
        ])
        .unwrap()
    }

    fn existing(id: &str, name: &str, target: &str) -> Record {
        Record::alias(name, target).with_id(id)
    }

    #[test]
    fn desired_from_snapshot() {
        let snapshot = IngressSnapshot::new(
            1,
            vec![
                IngressEntry::new("a.example.com", Scheme::Internal, LABEL),
                IngressEntry::new("B.example.com.", Scheme::InternetFacing, LABEL),
                IngressEntry::new("c.example.com", Scheme::Internal, "other"),
                IngressEntry::new("d.example.org", Scheme::Internal, LABEL),
                IngressEntry::new("notexample.com", Scheme::Internal, LABEL),
            ],
        );

        let desired = desired_records(ZONE, LABEL, &snapshot, &load_balancers());

        assert_eq!(
            desired,
            vec![
                Record::alias("a.example.com", "lb-new.elb"),
                Record::alias("b.example.com", "lb-ext.elb"),
            ]
        );
    }

    #[test]
    fn conflicting_schemes_keep_first() {
        let snapshot = IngressSnapshot::new(
            1,
            vec![
                IngressEntry::new("a.example.com", Scheme::InternetFacing, LABEL),
                IngressEntry::new("a.example.com", Scheme::Internal, LABEL),
            ],
        );

        let desired = desired_records(ZONE, LABEL, &snapshot, &load_balancers());

        assert_eq!(desired, vec![Record::alias("a.example.com", "lb-new.elb")]);
    }

    #[test]
    fn missing_scheme_is_skipped() {
        let load_balancers = LoadBalancers::group(vec![LoadBalancer::new(
            "int",
            "lb-new.elb",
            Scheme::Internal,
        )])
        .unwrap();

        let snapshot = IngressSnapshot::new(
            1,
            vec![IngressEntry::new("a.example.com", Scheme::InternetFacing, LABEL)],
        );

        assert!(desired_records(ZONE, LABEL, &snapshot, &load_balancers).is_empty());
    }

    #[test]
    fn changed_target_is_one_upsert() {
        let desired = vec![Record::alias("a.example.com", "lb-new.elb")];
        let existing = vec![existing("1", "a.example.com", "lb-old.elb")];

        let batch = diff(&desired, &existing, |_| true);

        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.deletes.len(), 0);
        assert_eq!(batch.upserts[0].record.target, "lb-new.elb");
        assert_eq!(batch.upserts[0].existing.as_ref().unwrap().id.as_deref(), Some("1"));
    }

    #[test]
    fn stale_owned_record_is_one_delete() {
        let desired = vec![Record::alias("a.example.com", "lb-new.elb")];
        let existing = vec![
            existing("1", "a.example.com", "lb-new.elb"),
            existing("2", "stale.example.com", "lb-new.elb"),
        ];

        let batch = diff(&desired, &existing, |_| true);

        assert!(batch.upserts.is_empty());
        assert_eq!(batch.deletes.len(), 1);
        assert_eq!(batch.deletes[0].name, "stale.example.com");
    }

    #[test]
    fn foreign_record_is_kept() {
        let existing = vec![existing("1", "manual.example.com", "somewhere.else")];

        let batch = diff(&[], &existing, |record| record.target.ends_with(".elb"));

        assert!(batch.is_empty());
    }

    #[test]
    fn unchanged_is_noop() {
        let desired = vec![Record::alias("a.example.com", "lb-new.elb")];
        let existing = vec![existing("1", "A.Example.com.", "LB-NEW.elb.")];

        assert!(diff(&desired, &existing, |_| true).is_empty());
    }

    #[test]
    fn new_host_is_created() {
        let desired = vec![Record::alias("a.example.com", "lb-new.elb")];
        let a_record = Record {
            id: Some("1".to_string()),
            name: "a.example.com".to_string(),
            kind: RecordKind::A,
            target: "10.0.0.1".to_string(),
        };

        let existing = [a_record];
        let batch = diff(&desired, &existing, |_| false);

        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.upserts[0].existing, None);

        let conflicts = conflicting_records(&batch, &existing);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].1.id.as_deref(), Some("1"));
    }

    #[test]
    fn owned_record_of_other_kind_is_replaced() {
        let desired = vec![Record::pointing_at("a.example.com", "203.0.113.7")];
        let existing = vec![existing("1", "a.example.com", "lb-old.elb")];

        let batch = diff(&desired, &existing, |_| true);

        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(batch.upserts[0].record.kind, RecordKind::A);
        assert_eq!(batch.deletes, existing);
        assert!(conflicting_records(&batch, &existing).is_empty());
    }

    #[test]
    fn ip_only_load_balancer_gets_address_records() {
        let load_balancers = LoadBalancers::group(vec![
            LoadBalancer::new("int", "203.0.113.7", Scheme::Internal),
            LoadBalancer::new("ext", "2001:db8::7", Scheme::InternetFacing),
        ])
        .unwrap();

        let snapshot = IngressSnapshot::new(
            1,
            vec![
                IngressEntry::new("a.example.com", Scheme::Internal, LABEL),
                IngressEntry::new("b.example.com", Scheme::InternetFacing, LABEL),
            ],
        );

        let desired = desired_records(ZONE, LABEL, &snapshot, &load_balancers);

        assert_eq!(
            desired,
            vec![
                Record {
                    id: None,
                    name: "a.example.com".to_string(),
                    kind: RecordKind::A,
                    target: "203.0.113.7".to_string(),
                },
                Record {
                    id: None,
                    name: "b.example.com".to_string(),
                    kind: RecordKind::AAAA,
                    target: "2001:db8::7".to_string(),
                },
            ]
        );
    }
}
