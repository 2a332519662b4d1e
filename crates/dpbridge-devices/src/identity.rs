//! Static device identity.

use std::collections::{BTreeMap, BTreeSet};

use dpbridge_core::config::clusters;
use dpbridge_core::{ClusterId, EndpointId};
use serde::{Deserialize, Serialize};

/// What a device announced about itself: vendor and model strings plus
/// the clusters found on each endpoint.
///
/// Built once per attach through [`DeviceIdentityBuilder`] and not mutated
/// afterwards; a firmware re-announce produces a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    vendor: String,
    model: String,
    endpoints: BTreeMap<EndpointId, BTreeSet<ClusterId>>,
    proprietary: BTreeSet<ClusterId>,
}

impl DeviceIdentity {
    pub fn builder(vendor: impl Into<String>, model: impl Into<String>) -> DeviceIdentityBuilder {
        DeviceIdentityBuilder {
            identity: DeviceIdentity {
                vendor: vendor.into(),
                model: model.into(),
                endpoints: BTreeMap::new(),
                proprietary: BTreeSet::new(),
            },
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Endpoints and the clusters present on each.
    pub fn endpoints(&self) -> &BTreeMap<EndpointId, BTreeSet<ClusterId>> {
        &self.endpoints
    }

    /// Proprietary clusters known to exist even if not enumerated on an endpoint.
    pub fn proprietary_clusters(&self) -> &BTreeSet<ClusterId> {
        &self.proprietary
    }

    /// Whether any endpoint carries the cluster.
    pub fn has_cluster(&self, cluster: ClusterId) -> bool {
        self.endpoints.values().any(|set| set.contains(&cluster))
    }

    /// Whether any of the clusters is present, either on an endpoint or as a
    /// known proprietary cluster.
    pub fn has_any(&self, clusters: &[ClusterId]) -> bool {
        clusters
            .iter()
            .any(|c| self.has_cluster(*c) || self.proprietary.contains(c))
    }

    pub fn endpoint_has(&self, endpoint: EndpointId, cluster: ClusterId) -> bool {
        self.endpoints
            .get(&endpoint)
            .map(|set| set.contains(&cluster))
            .unwrap_or(false)
    }

    /// Lowest endpoint carrying the cluster.
    pub fn endpoint_for(&self, cluster: ClusterId) -> Option<EndpointId> {
        self.endpoints
            .iter()
            .find(|(_, set)| set.contains(&cluster))
            .map(|(ep, _)| *ep)
    }

    /// Number of independently switched channels.
    ///
    /// The larger of the On/Off endpoint count and the channel count encoded
    /// in `TS000N` / `TS001N` model names.
    pub fn gang_count(&self) -> u8 {
        let on_off = self
            .endpoints
            .values()
            .filter(|set| set.contains(&clusters::ON_OFF))
            .count() as u8;
        on_off.max(model_gang_count(&self.model).unwrap_or(0))
    }

    pub fn is_multi_gang(&self) -> bool {
        self.gang_count() > 1
    }

    /// Whether vendor or model differ.
    pub fn fingerprint_differs(&self, other: &DeviceIdentity) -> bool {
        self.vendor != other.vendor || self.model != other.model
    }
}

fn model_gang_count(model: &str) -> Option<u8> {
    let rest = model.strip_prefix("TS00")?;
    let mut chars = rest.chars();
    let series = chars.next()?;
    let digit = chars.next()?.to_digit(10)?;
    if chars.next().is_some() || !matches!(series, '0' | '1') || !(1..=6).contains(&digit) {
        return None;
    }
    Some(digit as u8)
}

/// Builder for [`DeviceIdentity`].
#[derive(Debug, Clone)]
pub struct DeviceIdentityBuilder {
    identity: DeviceIdentity,
}

impl DeviceIdentityBuilder {
    /// Register an endpoint with no clusters yet.
    pub fn endpoint(mut self, endpoint: EndpointId) -> Self {
        self.identity.endpoints.entry(endpoint).or_default();
        self
    }

    pub fn cluster(mut self, endpoint: EndpointId, cluster: ClusterId) -> Self {
        self.identity
            .endpoints
            .entry(endpoint)
            .or_default()
            .insert(cluster);
        self
    }

    pub fn clusters(mut self, endpoint: EndpointId, ids: &[ClusterId]) -> Self {
        self.identity
            .endpoints
            .entry(endpoint)
            .or_default()
            .extend(ids.iter().copied());
        self
    }

    /// Register a cluster by alias or textual id. Unknown names are logged
    /// and ignored.
    pub fn cluster_named(self, endpoint: EndpointId, name: &str) -> Self {
        match clusters::resolve(name) {
            Some(id) => self.cluster(endpoint, id),
            None => {
                tracing::debug!("Ignoring unknown cluster name '{}' on endpoint {}", name, endpoint);
                self
            }
        }
    }

    /// Record a proprietary cluster that is in use but may not be
    /// enumerable on any endpoint.
    pub fn proprietary(mut self, cluster: ClusterId) -> Self {
        self.identity.proprietary.insert(cluster);
        self
    }

    pub fn build(self) -> DeviceIdentity {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookups() {
        let identity = DeviceIdentity::builder("_TZE200_abc", "TS0601")
            .cluster_named(1, "msTemperatureMeasurement")
            .cluster_named(1, "manuSpecificTuya")
            .cluster_named(1, "bogus")
            .cluster(2, clusters::ON_OFF)
            .build();

        assert!(identity.has_cluster(clusters::TEMPERATURE_MEASUREMENT));
        assert!(identity.has_cluster(clusters::TUYA_PROPRIETARY));
        assert!(identity.endpoint_has(2, clusters::ON_OFF));
        assert!(!identity.endpoint_has(1, clusters::ON_OFF));
        assert_eq!(identity.endpoint_for(clusters::ON_OFF), Some(2));
        assert_eq!(identity.endpoints()[&1].len(), 2);
    }

    #[test]
    fn test_gang_count_from_model() {
        let identity = DeviceIdentity::builder("_TZ3000_x", "TS0003").build();
        assert_eq!(identity.gang_count(), 3);
        assert!(identity.is_multi_gang());

        let identity = DeviceIdentity::builder("_TZ3000_x", "TS0601").build();
        assert_eq!(identity.gang_count(), 0);
        let identity = DeviceIdentity::builder("_TZ3000_x", "TS0012").build();
        assert_eq!(identity.gang_count(), 2);
    }

    #[test]
    fn test_gang_count_from_endpoints() {
        let identity = DeviceIdentity::builder("SONOFF", "ZBMINI")
            .cluster(1, clusters::ON_OFF)
            .cluster(2, clusters::ON_OFF)
            .build();
        assert_eq!(identity.gang_count(), 2);
    }

    #[test]
    fn test_fingerprint() {
        let a = DeviceIdentity::builder("v", "m").cluster(1, 6).build();
        let b = DeviceIdentity::builder("v", "m").build();
        let c = DeviceIdentity::builder("v", "m2").build();
        assert!(!a.fingerprint_differs(&b));
        assert!(a.fingerprint_differs(&c));
    }
}
