//! Protocol classification.
//!
//! No standard handshake says "this device speaks the overlay", so the
//! decision combines model/vendor heuristics with the clusters that are
//! physically present. Rules are tried in a fixed order and the first match
//! wins:
//!
//! 1. known pure-overlay model whose proprietary cluster is absent but
//!    which carries native climate/power clusters: `Hybrid`, prefer native
//! 2. known pure-overlay model: `Overlay`, passive unless the proprietary
//!    cluster is present
//! 3. overlay vendor prefix with the proprietary cluster present: `Overlay`
//! 4. proprietary cluster present on a multi-gang device, or without a
//!    native equivalent: `Overlay`
//! 5. overlay traffic already seen in this session: `Overlay`, passive
//! 6. otherwise `Native`

use dpbridge_core::config::clusters;
use dpbridge_core::ClusterId;
use serde::{Deserialize, Serialize};

use crate::identity::DeviceIdentity;

/// Protocol a device is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Native,
    Overlay,
    Hybrid,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Native => write!(f, "native"),
            Protocol::Overlay => write!(f, "overlay"),
            Protocol::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationRule {
    HybridNativeClusters,
    PureOverlayModel,
    OverlayVendor,
    ProprietaryCluster,
    SessionContinuity,
    NativeDefault,
}

/// Classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDecision {
    pub protocol: Protocol,
    /// Proprietary channel in use but not enumerable; frames only arrive
    /// unsolicited.
    pub passive: bool,
    /// Hybrid only: native values win when both paths report.
    pub prefer_native_on_conflict: bool,
    pub rule: ClassificationRule,
    /// More than one rule matched with different outcomes.
    pub ambiguous: bool,
}

impl ProtocolDecision {
    fn new(protocol: Protocol, passive: bool, rule: ClassificationRule) -> Self {
        Self {
            protocol,
            passive,
            prefer_native_on_conflict: protocol == Protocol::Hybrid,
            rule,
            ambiguous: false,
        }
    }

    /// Whether overlay frames feed the binding registry.
    pub fn uses_overlay(&self) -> bool {
        matches!(self.protocol, Protocol::Overlay | Protocol::Hybrid)
    }

    /// Whether native attribute reads are the primary source.
    pub fn uses_native_reads(&self) -> bool {
        matches!(self.protocol, Protocol::Native | Protocol::Hybrid)
    }

    fn same_outcome(&self, other: &ProtocolDecision) -> bool {
        self.protocol == other.protocol && self.passive == other.passive
    }
}

fn default_pure_overlay_models() -> Vec<String> {
    vec!["TS0601".to_string()]
}

fn default_overlay_vendor_prefixes() -> Vec<String> {
    vec!["_TZE".to_string()]
}

fn default_proprietary_clusters() -> Vec<ClusterId> {
    vec![clusters::TUYA_PROPRIETARY]
}

fn default_native_climate_power() -> Vec<ClusterId> {
    clusters::NATIVE_CLIMATE_POWER.to_vec()
}

fn default_native_equivalents() -> Vec<ClusterId> {
    let mut ids = vec![
        clusters::ON_OFF,
        clusters::LEVEL_CONTROL,
        clusters::WINDOW_COVERING,
        clusters::THERMOSTAT,
        clusters::COLOR_CONTROL,
        clusters::OCCUPANCY_SENSING,
        clusters::IAS_ZONE,
    ];
    ids.extend_from_slice(clusters::NATIVE_CLIMATE_POWER);
    ids
}

/// Heuristic tables used by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRules {
    /// Models that only ever speak the overlay. Exact match.
    #[serde(default = "default_pure_overlay_models")]
    pub pure_overlay_models: Vec<String>,

    /// Vendor string prefixes that require the overlay.
    #[serde(default = "default_overlay_vendor_prefixes")]
    pub overlay_vendor_prefixes: Vec<String>,

    /// Cluster ids carrying the overlay.
    #[serde(default = "default_proprietary_clusters")]
    pub proprietary_clusters: Vec<ClusterId>,

    /// Native clusters that make a pure-overlay model a hybrid.
    #[serde(default = "default_native_climate_power")]
    pub native_climate_power_clusters: Vec<ClusterId>,

    /// Native clusters that can carry what the overlay would carry.
    #[serde(default = "default_native_equivalents")]
    pub native_equivalent_clusters: Vec<ClusterId>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            pure_overlay_models: default_pure_overlay_models(),
            overlay_vendor_prefixes: default_overlay_vendor_prefixes(),
            proprietary_clusters: default_proprietary_clusters(),
            native_climate_power_clusters: default_native_climate_power(),
            native_equivalent_clusters: default_native_equivalents(),
        }
    }
}

/// Protocol classifier.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: ClassifierRules,
}

impl Classifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Classify with no overlay session history.
    pub fn classify(&self, identity: &DeviceIdentity) -> ProtocolDecision {
        self.classify_with_session(identity, false)
    }

    /// Classify, taking into account whether overlay traffic has already been
    /// handled for this device.
    ///
    /// Pure function of its inputs: the same identity and session flag always
    /// give the same decision.
    pub fn classify_with_session(
        &self,
        identity: &DeviceIdentity,
        overlay_active: bool,
    ) -> ProtocolDecision {
        let matches = self.matching_rules(identity, overlay_active);
        let mut decision = matches
            .first()
            .copied()
            .unwrap_or_else(|| ProtocolDecision::new(Protocol::Native, false, ClassificationRule::NativeDefault));

        decision.ambiguous = matches
            .iter()
            .skip(1)
            .any(|other| !other.same_outcome(&decision));

        if decision.ambiguous {
            tracing::debug!(
                vendor = identity.vendor(),
                model = identity.model(),
                "Ambiguous classification, {} rules matched; using {:?}",
                matches.len(),
                decision.rule
            );
        }
        decision
    }

    fn matching_rules(&self, identity: &DeviceIdentity, overlay_active: bool) -> Vec<ProtocolDecision> {
        let rules = &self.rules;
        let has_proprietary = identity.has_any(&rules.proprietary_clusters);
        let pure_overlay_model = rules
            .pure_overlay_models
            .iter()
            .any(|m| m == identity.model());
        let overlay_vendor = rules
            .overlay_vendor_prefixes
            .iter()
            .any(|p| identity.vendor().starts_with(p.as_str()));
        let has_climate_power = identity.has_any(&rules.native_climate_power_clusters);
        let has_native_equivalent = identity.has_any(&rules.native_equivalent_clusters);

        let mut matches = Vec::new();

        if pure_overlay_model && !has_proprietary && has_climate_power {
            matches.push(ProtocolDecision::new(
                Protocol::Hybrid,
                false,
                ClassificationRule::HybridNativeClusters,
            ));
        }
        if pure_overlay_model {
            matches.push(ProtocolDecision::new(
                Protocol::Overlay,
                !has_proprietary,
                ClassificationRule::PureOverlayModel,
            ));
        }
        if overlay_vendor && has_proprietary {
            matches.push(ProtocolDecision::new(
                Protocol::Overlay,
                false,
                ClassificationRule::OverlayVendor,
            ));
        }
        if has_proprietary && (identity.is_multi_gang() || !has_native_equivalent) {
            matches.push(ProtocolDecision::new(
                Protocol::Overlay,
                false,
                ClassificationRule::ProprietaryCluster,
            ));
        }
        if overlay_active {
            matches.push(ProtocolDecision::new(
                Protocol::Overlay,
                true,
                ClassificationRule::SessionContinuity,
            ));
        }
        matches
    }
}
