use std::fmt::{self, Debug, Display, Formatter};
use std::net::IpAddr;
use std::ops::Deref;

use async_trait::async_trait;

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordKind {
    A,
    AAAA,
    CNAME,
    Other,
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Lowercase, without the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Identity of a record inside a zone, the diff matches desired and existing records by it.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordKey {
    pub name: String,
    pub kind: RecordKind,
}

/// A DNS record, either read from the provider (`id` is set) or desired.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub id: Option<String>,
    pub name: String,
    pub kind: RecordKind,
    pub target: String,
}

impl Record {
    /// Desired alias record `name -> target`.
    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: RecordKind::CNAME,
            target: target.into(),
        }
    }

    /// Desired record `name -> target`, an address record when `target` is an IP address
    /// and an alias otherwise.
    pub fn pointing_at(name: impl Into<String>, target: &str) -> Self {
        let kind = match target.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => RecordKind::A,
            Ok(IpAddr::V6(_)) => RecordKind::AAAA,
            Err(_) => RecordKind::CNAME,
        };

        Self {
            id: None,
            name: name.into(),
            kind,
            target: target.trim().to_string(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());

        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: normalize_name(&self.name),
            kind: self.kind,
        }
    }

    pub fn is_alias(&self) -> bool {
        self.kind == RecordKind::CNAME
    }

    /// Whether the record may point at a load balancer.
    pub fn is_routing(&self) -> bool {
        matches!(self.kind, RecordKind::A | RecordKind::AAAA | RecordKind::CNAME)
    }

    /// Same target, ignoring case and the trailing dot.
    pub fn same_target(&self, other: &Record) -> bool {
        normalize_name(&self.target) == normalize_name(&other.target)
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.kind, self.target)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Upsert {
    pub record: Record,
    /// The record being replaced, `None` when it has to be created.
    pub existing: Option<Record>,
}

/// Changes computed by one update, sent to the provider as one unit.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ChangeBatch {
    pub upserts: Vec<Upsert>,
    pub deletes: Vec<Record>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// Client of the DNS service hosting the managed zone.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Look up the provider id of the zone named `zone`.
    async fn resolve_zone(&self, zone: &str) -> anyhow::Result<String>;

    async fn list_records(&self, zone_id: &str) -> anyhow::Result<Vec<Record>>;

    /// Apply `batch`, failing when any change can't be applied.
    async fn apply(&self, zone_id: &str, batch: &ChangeBatch) -> anyhow::Result<()>;
}

#[async_trait]
impl<P, T> DnsProvider for T
where
    T: Deref<Target = P> + Send + Sync,
    P: DnsProvider + ?Sized,
{
    async fn resolve_zone(&self, zone: &str) -> anyhow::Result<String> {
        self.deref().resolve_zone(zone).await
    }

    async fn list_records(&self, zone_id: &str) -> anyhow::Result<Vec<Record>> {
        self.deref().list_records(zone_id).await
    }

    async fn apply(&self, zone_id: &str, batch: &ChangeBatch) -> anyhow::Result<()> {
        self.deref().apply(zone_id, batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_normalized() {
        let a = Record::alias("A.Example.com.", "lb.elb");
        let b = Record::alias("a.example.com", "other.elb");

        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().name, "a.example.com");
    }

    #[test]
    fn same_target_ignores_case_and_dot() {
        let a = Record::alias("a.example.com", "LB-1.elb.amazonaws.com.");
        let b = Record::alias("a.example.com", "lb-1.elb.amazonaws.com");

        assert!(a.same_target(&b));
        assert!(!a.same_target(&Record::alias("a.example.com", "lb-2.elb.amazonaws.com")));
    }

    #[test]
    fn kind_follows_target() {
        assert_eq!(
            Record::pointing_at("a.example.com", "lb.elb.amazonaws.com"),
            Record::alias("a.example.com", "lb.elb.amazonaws.com")
        );
        assert_eq!(
            Record::pointing_at("a.example.com", "203.0.113.7").kind,
            RecordKind::A
        );
        assert_eq!(
            Record::pointing_at("a.example.com", "2001:db8::7").kind,
            RecordKind::AAAA
        );
    }
}
