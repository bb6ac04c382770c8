use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Which kind of load balancer an ingress host wants to be reachable through.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Scheme {
    Internal,
    InternetFacing,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Internal => "internal",
            Scheme::InternetFacing => "internet-facing",
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(Scheme::Internal),
            "internet-facing" | "external" => Ok(Scheme::InternetFacing),
            other => Err(anyhow::anyhow!("unknown load balancer scheme {:?}", other)),
        }
    }
}

/// One externally reachable host requested by an ingress.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IngressEntry {
    pub host: String,
    pub scheme: Scheme,
    pub required_label: String,
}

impl IngressEntry {
    pub fn new(host: impl Into<String>, scheme: Scheme, required_label: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scheme,
            required_label: required_label.into(),
        }
    }
}

/// Immutable, versioned view of the desired external state.
///
/// Version 0 is the placeholder published before the cluster watch has listed anything,
/// it must never be reconciled against.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct IngressSnapshot {
    version: u64,
    entries: BTreeSet<IngressEntry>,
}

impl IngressSnapshot {
    pub fn new(version: u64, entries: impl IntoIterator<Item = IngressEntry>) -> Self {
        Self {
            version,
            entries: entries.into_iter().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_synced(&self) -> bool {
        self.version > 0
    }

    pub fn entries(&self) -> impl Iterator<Item = &IngressEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn same_entries(&self, other: &BTreeSet<IngressEntry>) -> bool {
        &self.entries == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scheme() {
        assert_eq!("internal".parse::<Scheme>().unwrap(), Scheme::Internal);
        assert_eq!(
            " Internet-Facing ".parse::<Scheme>().unwrap(),
            Scheme::InternetFacing
        );
        assert!("public".parse::<Scheme>().is_err());
    }

    #[test]
    fn entries_are_deduplicated_and_ordered() {
        let snapshot = IngressSnapshot::new(
            3,
            vec![
                IngressEntry::new("b.example.com", Scheme::Internal, "frontend"),
                IngressEntry::new("a.example.com", Scheme::Internal, "frontend"),
                IngressEntry::new("b.example.com", Scheme::Internal, "frontend"),
            ],
        );

        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.entries().map(|entry| entry.host.as_str()).collect::<Vec<_>>(),
            vec!["a.example.com", "b.example.com"]
        );
        assert!(snapshot.is_synced());
        assert!(!IngressSnapshot::default().is_synced());
    }
}
