use std::collections::HashSet;
use std::fmt::Debug;
use std::str::FromStr;

use crate::dns::directory::LoadBalancers;
use crate::dns::provider::{normalize_name, Record};

/// Decides which existing records the updater is allowed to delete.
///
/// Upserts may overwrite any record with the same key, deletes only touch owned records.
pub trait OwnershipPolicy: Debug + Send + Sync {
    fn owns(&self, record: &Record, load_balancers: &LoadBalancers) -> bool;
}

/// Owns records pointing at one of the currently discovered load balancers.
#[derive(Debug, Default, Copy, Clone)]
pub struct AliasTargetOwnership;

impl OwnershipPolicy for AliasTargetOwnership {
    fn owns(&self, record: &Record, load_balancers: &LoadBalancers) -> bool {
        if !record.is_routing() {
            return false;
        }

        let targets = load_balancers
            .iter()
            .map(|load_balancer| normalize_name(&load_balancer.dns_name))
            .collect::<HashSet<_>>();

        targets.contains(&normalize_name(&record.target))
    }
}

/// Owns every alias or address record below a dedicated sub-domain.
#[derive(Debug, Clone)]
pub struct SuffixOwnership {
    suffix: String,
}

impl SuffixOwnership {
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: normalize_name(suffix),
        }
    }
}

impl OwnershipPolicy for SuffixOwnership {
    fn owns(&self, record: &Record, _: &LoadBalancers) -> bool {
        if !record.is_routing() {
            return false;
        }

        let name = normalize_name(&record.name);

        name.strip_suffix(&self.suffix)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OwnershipKind {
    AliasTarget,
    Suffix,
}

impl FromStr for OwnershipKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alias-target" => Ok(OwnershipKind::AliasTarget),
            "suffix" => Ok(OwnershipKind::Suffix),
            other => Err(anyhow::anyhow!("unknown ownership policy {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::directory::LoadBalancer;
    use crate::dns::provider::RecordKind;
    use crate::snapshot::Scheme;

    fn load_balancers() -> LoadBalancers {
        LoadBalancers::group(vec![
            LoadBalancer::new("frontend", "lb-new.elb.amazonaws.com", Scheme::Internal),
            LoadBalancer::new("public", "203.0.113.7", Scheme::InternetFacing),
        ])
        .unwrap()
    }

    #[test]
    fn alias_target() {
        let policy = AliasTargetOwnership;

        assert!(policy.owns(
            &Record::alias("a.example.com", "LB-NEW.elb.amazonaws.com."),
            &load_balancers()
        ));
        assert!(!policy.owns(
            &Record::alias("a.example.com", "lb-old.elb.amazonaws.com"),
            &load_balancers()
        ));

        assert!(policy.owns(
            &Record::pointing_at("b.example.com", "203.0.113.7"),
            &load_balancers()
        ));
        assert!(!policy.owns(
            &Record::pointing_at("b.example.com", "203.0.113.8"),
            &load_balancers()
        ));

        let txt_record = Record {
            id: None,
            name: "a.example.com".to_string(),
            kind: RecordKind::Other,
            target: "lb-new.elb.amazonaws.com".to_string(),
        };
        assert!(!policy.owns(&txt_record, &load_balancers()));
    }

    #[test]
    fn suffix() {
        let policy = SuffixOwnership::new("ingress.example.com.");
        let none = LoadBalancers::default();

        assert!(policy.owns(&Record::alias("a.ingress.example.com", "x"), &none));
        assert!(!policy.owns(&Record::alias("ingress.example.com", "x"), &none));
        assert!(!policy.owns(&Record::alias("a.badingress.example.com", "x"), &none));
        assert!(!policy.owns(&Record::alias("a.example.com", "x"), &none));
    }

    #[test]
    fn parse_kind() {
        assert_eq!(
            "alias-target".parse::<OwnershipKind>().unwrap(),
            OwnershipKind::AliasTarget
        );
        assert_eq!("suffix".parse::<OwnershipKind>().unwrap(), OwnershipKind::Suffix);
        assert!("txt".parse::<OwnershipKind>().is_err());
    }
}
