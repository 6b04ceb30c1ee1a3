use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::policy::PolicyOrder;
use crate::snapshot::ClusterAddressClassifier;

/// True when every address of `inner` is inside `outer`.
pub fn covers(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    outer.is_ipv4() == inner.is_ipv4()
        && outer.prefix() <= inner.prefix()
        && outer.contains(inner.network())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind {
    Gateway,
    Excluded,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyCidrs {
    pub destinations: Vec<IpNetwork>,
    pub excluded: Vec<IpNetwork>,
}

impl PolicyCidrs {
    /// Prefix length of the most specific destination CIDR routing
    /// `destination` through the gateway. Exclusion always wins.
    pub fn matches(
        &self,
        destination: &IpAddr,
        classifier: &impl ClusterAddressClassifier,
    ) -> Option<u8> {
        if classifier.is_cluster_internal(destination)
            || self.excluded.iter().any(|net| net.contains(*destination))
        {
            return None;
        }
        self.destinations
            .iter()
            .filter(|net| net.contains(*destination))
            .map(|net| net.prefix())
            .max()
    }

    /// Prefix length of the most specific destination CIDR routing the whole
    /// of `network` through the gateway. None when an exclusion covers it.
    pub fn routes(
        &self,
        network: &IpNetwork,
        classifier: &impl ClusterAddressClassifier,
    ) -> Option<u8> {
        if classifier.is_internal_network(network)
            || self.excluded.iter().any(|excl| covers(excl, network))
        {
            return None;
        }
        self.destinations
            .iter()
            .filter(|dest| covers(dest, network))
            .map(|dest| dest.prefix())
            .max()
    }

    /// Table rows for one source address. Destinations fully covered by an
    /// exclusion or by cluster-internal space are dropped. An exclusion of the
    /// source family produces an excluded row when it overlaps one of the
    /// policy's own destinations.
    pub fn expand(
        &self,
        source: &IpAddr,
        classifier: &impl ClusterAddressClassifier,
    ) -> Vec<(IpNetwork, RowKind)> {
        let same_family = |net: &&IpNetwork| net.is_ipv4() == source.is_ipv4();
        let included = self
            .destinations
            .iter()
            .filter(same_family)
            .filter(|dest| !self.excluded.iter().any(|excl| covers(excl, dest)))
            .filter(|dest| !classifier.is_internal_network(dest))
            .map(|dest| (*dest, RowKind::Gateway));
        let excluded = self
            .excluded
            .iter()
            .filter(same_family)
            .filter(|excl| {
                self.destinations
                    .iter()
                    .any(|dest| covers(dest, excl) || covers(excl, dest))
            })
            .map(|excl| (*excl, RowKind::Excluded));
        included.chain(excluded).collect()
    }
}

/// Winner among policies matching the same destination: longest destination
/// prefix, then the policy order.
pub fn select_policy<'a, T>(
    candidates: impl IntoIterator<Item = (&'a PolicyCidrs, &'a PolicyOrder, T)>,
    destination: &IpAddr,
    classifier: &impl ClusterAddressClassifier,
) -> Option<T> {
    most_specific(candidates.into_iter().filter_map(|(cidrs, order, item)| {
        cidrs
            .matches(destination, classifier)
            .map(|prefix| (prefix, order, item))
    }))
}

/// Same ordering as `select_policy`, for a whole destination network.
pub fn select_route<'a, T>(
    candidates: impl IntoIterator<Item = (&'a PolicyCidrs, &'a PolicyOrder, T)>,
    network: &IpNetwork,
    classifier: &impl ClusterAddressClassifier,
) -> Option<T> {
    most_specific(candidates.into_iter().filter_map(|(cidrs, order, item)| {
        cidrs
            .routes(network, classifier)
            .map(|prefix| (prefix, order, item))
    }))
}

fn most_specific<'a, T>(scored: impl Iterator<Item = (u8, &'a PolicyOrder, T)>) -> Option<T> {
    scored
        .min_by(|(a_prefix, a_order, _), (b_prefix, b_order, _)| {
            b_prefix.cmp(a_prefix).then_with(|| a_order.cmp(b_order))
        })
        .map(|(_, _, item)| item)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;
    use crate::snapshot::InternalAddresses;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn cidrs(destinations: &[&str], excluded: &[&str]) -> PolicyCidrs {
        PolicyCidrs {
            destinations: destinations.iter().map(|d| net(d)).collect(),
            excluded: excluded.iter().map(|e| net(e)).collect(),
        }
    }

    fn internal() -> InternalAddresses {
        InternalAddresses::new(
            [ip("10.0.0.1"), ip("10.244.1.5")],
            [net("10.96.0.0/12"), net("10.244.0.0/16")],
        )
    }

    #[test]
    fn test_covers() {
        assert!(covers(&net("10.0.0.0/8"), &net("10.1.0.0/16")));
        assert!(covers(&net("10.1.0.0/16"), &net("10.1.0.0/16")));
        assert!(!covers(&net("10.1.0.0/16"), &net("10.0.0.0/8")));
        assert!(!covers(&net("10.0.0.0/8"), &net("11.0.0.0/16")));
        assert!(!covers(&net("0.0.0.0/0"), &net("::/0")));
    }

    #[test]
    fn test_exclusion_precedence() {
        let policy = cidrs(&["192.168.0.0/16"], &["192.168.5.0/24"]);
        let classifier = internal();

        assert_eq!(policy.matches(&ip("192.168.1.1"), &classifier), Some(16));
        assert_eq!(policy.matches(&ip("192.168.5.7"), &classifier), None);
        assert_eq!(policy.matches(&ip("172.16.0.1"), &classifier), None);

        // a less specific exclusion still wins
        let broad = cidrs(&["192.168.5.0/24"], &["192.168.0.0/16"]);
        assert_eq!(broad.matches(&ip("192.168.5.7"), &classifier), None);
    }

    #[test]
    fn test_cluster_internal_never_matches() {
        let policy = cidrs(&["0.0.0.0/0"], &[]);
        let classifier = internal();
        assert_eq!(policy.matches(&ip("10.0.0.1"), &classifier), None);
        assert_eq!(policy.matches(&ip("10.96.0.10"), &classifier), None);
        assert_eq!(policy.matches(&ip("10.244.3.3"), &classifier), None);
        assert_eq!(policy.matches(&ip("8.8.8.8"), &classifier), Some(0));
    }

    #[test]
    fn test_expand_subnet_minus_exclusion() {
        let policy = cidrs(&["172.20.0.0/16"], &["172.20.3.0/24"]);
        let rows = policy.expand(&ip("10.244.1.5"), &internal());
        assert_eq!(
            rows,
            vec![
                (net("172.20.0.0/16"), RowKind::Gateway),
                (net("172.20.3.0/24"), RowKind::Excluded),
            ]
        );

        let classifier = internal();
        assert_eq!(policy.matches(&ip("172.20.7.1"), &classifier), Some(16));
        assert_eq!(policy.matches(&ip("172.20.3.1"), &classifier), None);
    }

    #[test]
    fn test_expand_filters_family_and_internal() {
        let policy = cidrs(
            &["0.0.0.0/0", "::/0", "10.96.0.0/16", "192.168.0.0/24"],
            &["192.168.0.0/16", "2001:db8::/32"],
        );
        let v4 = policy.expand(&ip("10.244.1.5"), &internal());
        assert_eq!(
            v4,
            vec![
                (net("0.0.0.0/0"), RowKind::Gateway),
                (net("192.168.0.0/16"), RowKind::Excluded),
            ]
        );
        let v6 = policy.expand(&ip("fd00:10:244::5"), &internal());
        assert_eq!(
            v6,
            vec![
                (net("::/0"), RowKind::Gateway),
                (net("2001:db8::/32"), RowKind::Excluded),
            ]
        );
    }

    #[test]
    fn test_expand_skips_unrelated_exclusions() {
        let policy = cidrs(&["172.20.0.0/16"], &["172.20.3.0/24", "1.2.3.0/24", "172.0.0.0/8"]);
        let rows = policy.expand(&ip("10.244.1.5"), &internal());
        assert_eq!(
            rows,
            vec![
                (net("172.20.3.0/24"), RowKind::Excluded),
                (net("172.0.0.0/8"), RowKind::Excluded),
            ]
        );

        let policy = cidrs(&["172.20.0.0/16"], &["172.20.3.0/24", "1.2.3.0/24"]);
        let rows = policy.expand(&ip("10.244.1.5"), &internal());
        assert_eq!(
            rows,
            vec![
                (net("172.20.0.0/16"), RowKind::Gateway),
                (net("172.20.3.0/24"), RowKind::Excluded),
            ]
        );
    }

    #[test]
    fn test_routes_whole_network() {
        let policy = cidrs(&["0.0.0.0/0", "1.2.0.0/16"], &["1.2.3.0/24"]);
        let classifier = internal();

        assert_eq!(policy.routes(&net("1.2.0.0/16"), &classifier), Some(16));
        assert_eq!(policy.routes(&net("1.2.3.0/24"), &classifier), None);
        assert_eq!(policy.routes(&net("1.2.3.0/25"), &classifier), None);
        assert_eq!(policy.routes(&net("8.0.0.0/8"), &classifier), Some(0));
        assert_eq!(policy.routes(&net("10.96.0.0/16"), &classifier), None);
        assert_eq!(policy.routes(&net("::/0"), &classifier), None);
    }

    #[test]
    fn test_select_route_prefers_policy_routing_key() {
        let wide = cidrs(&["0.0.0.0/0"], &["1.2.3.0/24"]);
        let narrow = cidrs(&["1.2.0.0/16"], &[]);
        let old = PolicyOrder {
            created: Utc.timestamp_opt(10, 0).single(),
            name: "wide".into(),
        };
        let new = PolicyOrder {
            created: Utc.timestamp_opt(20, 0).single(),
            name: "narrow".into(),
        };
        let classifier = internal();
        let candidates = [(&wide, &old, "wide"), (&narrow, &new, "narrow")];

        assert_eq!(
            select_route(candidates, &net("1.2.3.0/24"), &classifier),
            Some("narrow")
        );
        assert_eq!(
            select_route(candidates, &net("0.0.0.0/0"), &classifier),
            Some("wide")
        );
        assert_eq!(
            select_route([(&wide, &old, "wide")], &net("1.2.3.0/24"), &classifier),
            None
        );
    }

    #[test]
    fn test_select_policy_order() {
        let wide = cidrs(&["0.0.0.0/0"], &[]);
        let narrow = cidrs(&["203.0.113.0/24"], &[]);
        let old = PolicyOrder {
            created: Utc.timestamp_opt(1_000, 0).single(),
            name: "zeta".into(),
        };
        let new = PolicyOrder {
            created: Utc.timestamp_opt(2_000, 0).single(),
            name: "alpha".into(),
        };
        let unknown = PolicyOrder {
            created: None,
            name: "aaa".into(),
        };
        let classifier = internal();

        // longest prefix first
        let winner = select_policy(
            [(&wide, &old, "wide"), (&narrow, &new, "narrow")],
            &ip("203.0.113.9"),
            &classifier,
        );
        assert_eq!(winner, Some("narrow"));

        // equal prefixes fall back to creation time, then name
        let winner = select_policy(
            [(&wide, &new, "new"), (&wide, &old, "old"), (&wide, &unknown, "unknown")],
            &ip("8.8.8.8"),
            &classifier,
        );
        assert_eq!(winner, Some("old"));

        let twin = PolicyOrder {
            created: old.created,
            name: "beta".into(),
        };
        let winner = select_policy(
            [(&wide, &old, "zeta"), (&wide, &twin, "beta")],
            &ip("8.8.8.8"),
            &classifier,
        );
        assert_eq!(winner, Some("beta"));

        let winner = select_policy([(&narrow, &old, "narrow")], &ip("8.8.8.8"), &classifier);
        assert_eq!(winner, None);
    }
}
