//! Capability binding registry.
//!
//! The registry is the single owner of a device's source → capability map.
//! Overlay DataPoints and native attribute reports both resolve through it;
//! the enrichment scanner only proposes additions via [`BindingRegistry::bind`].

use std::collections::{BTreeSet, HashMap};

use dpbridge_core::{AttributeValue, CapabilityValue, ClusterId, EndpointId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::DpType;
use crate::transform::ValueTransform;

/// Where a raw value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceKey {
    /// Overlay DataPoint id.
    DataPoint { dp: u8 },
    /// Native attribute on a cluster of an endpoint.
    Attribute {
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: String,
    },
}

impl SourceKey {
    pub fn dp(dp: u8) -> Self {
        SourceKey::DataPoint { dp }
    }

    pub fn attribute(endpoint: EndpointId, cluster: ClusterId, attribute: impl Into<String>) -> Self {
        SourceKey::Attribute {
            endpoint,
            cluster,
            attribute: attribute.into(),
        }
    }

    pub fn is_data_point(&self) -> bool {
        matches!(self, SourceKey::DataPoint { .. })
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKey::DataPoint { dp } => write!(f, "dp:{}", dp),
            SourceKey::Attribute {
                endpoint,
                cluster,
                attribute,
            } => write!(f, "ep{}/0x{:04X}/{}", endpoint, cluster, attribute),
        }
    }
}

/// Who created a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingOrigin {
    /// Static driver configuration.
    Declared,
    /// Enrichment scan or ambiguity guess.
    Inferred,
}

/// One source → capability association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityBinding {
    pub key: SourceKey,
    pub capability: String,
    pub transform: ValueTransform,
    pub origin: BindingOrigin,
    /// Set for guesses made from the shape of a value.
    #[serde(default)]
    pub low_confidence: bool,
    /// Wire type used when writing a DataPoint binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp_type: Option<DpType>,
}

impl CapabilityBinding {
    pub fn declared(key: SourceKey, capability: impl Into<String>, transform: ValueTransform) -> Self {
        Self {
            key,
            capability: capability.into(),
            transform,
            origin: BindingOrigin::Declared,
            low_confidence: false,
            dp_type: None,
        }
    }

    pub fn inferred(key: SourceKey, capability: impl Into<String>, transform: ValueTransform) -> Self {
        Self {
            origin: BindingOrigin::Inferred,
            ..Self::declared(key, capability, transform)
        }
    }

    pub fn with_dp_type(mut self, dp_type: DpType) -> Self {
        self.dp_type = Some(dp_type);
        self
    }
}

/// Bind error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    /// A declared binding already owns the key.
    #[error("{key} is declared as {existing}; inferred binding to {proposed} rejected")]
    Conflict {
        key: SourceKey,
        existing: String,
        proposed: String,
    },
}

/// A resolved value.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub capability: String,
    pub value: CapabilityValue,
    pub origin: BindingOrigin,
    pub low_confidence: bool,
}

/// One possible meaning of an overloaded key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meaning {
    pub capability: String,
    pub transform: ValueTransform,
}

impl Meaning {
    pub fn new(capability: impl Into<String>, transform: ValueTransform) -> Self {
        Self {
            capability: capability.into(),
            transform,
        }
    }
}

/// A key whose meaning depends on the device: a boolean-like reading means
/// one capability, a wider numeric range another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousKey {
    pub key: SourceKey,
    pub boolean: Meaning,
    pub wide: Meaning,
}

/// Known overloaded keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityTable {
    pub keys: Vec<AmbiguousKey>,
}

impl Default for AmbiguityTable {
    fn default() -> Self {
        Self {
            keys: vec![
                // Temperature on climate sensors, presence on PIR/radar units.
                AmbiguousKey {
                    key: SourceKey::dp(1),
                    boolean: Meaning::new("alarm_motion", ValueTransform::Boolean),
                    wide: Meaning::new("measure_temperature", ValueTransform::divide(10.0)),
                },
                // Door contact on some models, relative humidity on climate sensors.
                AmbiguousKey {
                    key: SourceKey::dp(2),
                    boolean: Meaning::new("alarm_contact", ValueTransform::Boolean),
                    wide: Meaning::new("measure_humidity", ValueTransform::Identity),
                },
                // Low-battery flag on some sensors, percentage on others.
                AmbiguousKey {
                    key: SourceKey::dp(14),
                    boolean: Meaning::new("alarm_battery", ValueTransform::Boolean),
                    wide: Meaning::new("measure_battery", ValueTransform::Identity),
                },
            ],
        }
    }
}

impl AmbiguityTable {
    pub fn get(&self, key: &SourceKey) -> Option<&AmbiguousKey> {
        self.keys.iter().find(|k| &k.key == key)
    }
}

/// Per-device binding registry.
///
/// All mutation goes through one `RwLock`, so scans, live reports and attach
/// configuration can share it.
#[derive(Debug)]
pub struct BindingRegistry {
    device_id: String,
    bindings: RwLock<HashMap<SourceKey, CapabilityBinding>>,
    declared_capabilities: BTreeSet<String>,
    ambiguity: AmbiguityTable,
}

impl BindingRegistry {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            bindings: RwLock::new(HashMap::new()),
            declared_capabilities: BTreeSet::new(),
            ambiguity: AmbiguityTable::default(),
        }
    }

    /// Capabilities the driver declares; ambiguity guesses must land in this set.
    pub fn with_declared_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ambiguity(mut self, ambiguity: AmbiguityTable) -> Self {
        self.ambiguity = ambiguity;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Bind a key to a capability.
    pub fn bind(
        &self,
        key: SourceKey,
        capability: impl Into<String>,
        transform: ValueTransform,
        origin: BindingOrigin,
    ) -> Result<Option<CapabilityBinding>, BindError> {
        let binding = CapabilityBinding {
            key,
            capability: capability.into(),
            transform,
            origin,
            low_confidence: false,
            dp_type: None,
        };
        self.insert(binding)
    }

    /// Insert a complete binding. Returns the binding it replaced.
    ///
    /// An inferred binding never replaces a declared one; that case fails
    /// with [`BindError::Conflict`] and leaves the registry unchanged.
    pub fn insert(&self, binding: CapabilityBinding) -> Result<Option<CapabilityBinding>, BindError> {
        let mut bindings = self.bindings.write();
        Self::insert_locked(&self.device_id, &mut bindings, binding)
    }

    fn insert_locked(
        device_id: &str,
        bindings: &mut HashMap<SourceKey, CapabilityBinding>,
        binding: CapabilityBinding,
    ) -> Result<Option<CapabilityBinding>, BindError> {
        if let Some(existing) = bindings.get(&binding.key) {
            if existing.origin == BindingOrigin::Declared && binding.origin == BindingOrigin::Inferred {
                return Err(BindError::Conflict {
                    key: binding.key.clone(),
                    existing: existing.capability.clone(),
                    proposed: binding.capability,
                });
            }
        }

        debug!(
            device_id,
            capability = %binding.capability,
            "Bound {} ({:?})",
            binding.key,
            binding.origin
        );
        Ok(bindings.insert(binding.key.clone(), binding))
    }

    /// Remove a binding. Only called on explicit driver or user action.
    pub fn unbind(&self, key: &SourceKey) -> Option<CapabilityBinding> {
        self.bindings.write().remove(key)
    }

    /// Undo an insert of `inserted`, putting `previous` back. A no-op when
    /// the key has been rebound since; returns whether anything changed.
    pub fn revert(&self, inserted: &CapabilityBinding, previous: Option<CapabilityBinding>) -> bool {
        let mut bindings = self.bindings.write();
        if bindings.get(&inserted.key) != Some(inserted) {
            return false;
        }
        match previous {
            Some(previous) => {
                bindings.insert(inserted.key.clone(), previous);
            }
            None => {
                bindings.remove(&inserted.key);
            }
        }
        true
    }

    pub fn get(&self, key: &SourceKey) -> Option<CapabilityBinding> {
        self.bindings.read().get(key).cloned()
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.bindings.read().contains_key(key)
    }

    /// Bindings targeting a capability, declared first.
    pub fn bindings_for(&self, capability: &str) -> Vec<CapabilityBinding> {
        let mut found: Vec<CapabilityBinding> = self
            .bindings
            .read()
            .values()
            .filter(|b| b.capability == capability)
            .cloned()
            .collect();
        found.sort_by_key(|b| (b.origin != BindingOrigin::Declared, b.key.clone()));
        found
    }

    pub fn capabilities(&self) -> BTreeSet<String> {
        self.bindings
            .read()
            .values()
            .map(|b| b.capability.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Map a raw value to `(capability, value)`.
    ///
    /// Returns `None` when nothing is bound (and no guess is possible) or
    /// the transform yields no finite value.
    pub fn resolve(&self, key: &SourceKey, raw: &AttributeValue) -> Option<Resolution> {
        {
            let bindings = self.bindings.read();
            if let Some(binding) = bindings.get(key) {
                if !self.contradicts_guess(binding, raw) {
                    return Self::apply(binding, raw);
                }
            } else if self.ambiguity.get(key).is_none() {
                return None;
            }
        }

        let mut bindings = self.bindings.write();
        // Re-check: another writer may have bound the key meanwhile.
        if let Some(binding) = bindings.get(key) {
            if !self.contradicts_guess(binding, raw) {
                return Self::apply(binding, raw);
            }
        }

        let guess = self.guess(key, raw)?;
        let rebinding = bindings.contains_key(key);
        warn!(
            device_id = %self.device_id,
            capability = %guess.capability,
            "Low-confidence binding: {} guessed as {} from value {:?}{}",
            key,
            guess.capability,
            raw,
            if rebinding { " (replacing contradicted guess)" } else { "" }
        );
        Self::insert_locked(&self.device_id, &mut bindings, guess.clone()).ok()?;
        Self::apply(&guess, raw)
    }

    fn apply(binding: &CapabilityBinding, raw: &AttributeValue) -> Option<Resolution> {
        let value = binding.transform.apply(raw)?;
        if !value.is_finite() {
            return None;
        }
        Some(Resolution {
            capability: binding.capability.clone(),
            value,
            origin: binding.origin,
            low_confidence: binding.low_confidence,
        })
    }

    /// A guessed boolean meaning is contradicted by a wide value.
    fn contradicts_guess(&self, binding: &CapabilityBinding, raw: &AttributeValue) -> bool {
        binding.low_confidence
            && binding.origin == BindingOrigin::Inferred
            && binding.transform.is_boolean()
            && raw.as_f64().is_some()
            && !raw.is_boolean_like()
    }

    fn guess(&self, key: &SourceKey, raw: &AttributeValue) -> Option<CapabilityBinding> {
        let entry = self.ambiguity.get(key)?;
        let meaning = if raw.is_boolean_like() {
            &entry.boolean
        } else {
            &entry.wide
        };
        if !self.declared_capabilities.contains(&meaning.capability) {
            debug!(
                device_id = %self.device_id,
                "No guess for {}: {} is not a declared capability",
                key,
                meaning.capability
            );
            return None;
        }
        let mut binding = CapabilityBinding::inferred(key.clone(), meaning.capability.clone(), meaning.transform.clone());
        binding.low_confidence = true;
        Some(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_scenario_value_frame() {
        let registry = BindingRegistry::new("dev");
        registry
            .bind(SourceKey::dp(1), "temperature", ValueTransform::divide(10.0), BindingOrigin::Declared)
            .unwrap();

        let res = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(150)).unwrap();
        assert_eq!(res.capability, "temperature");
        assert_eq!(res.value, CapabilityValue::Number(15.0));
    }

    #[test]
    fn test_declared_beats_inferred() {
        let registry = BindingRegistry::new("dev");
        registry
            .bind(SourceKey::dp(1), "measure_temperature", ValueTransform::divide(10.0), BindingOrigin::Declared)
            .unwrap();

        let err = registry
            .bind(SourceKey::dp(1), "alarm_motion", ValueTransform::Boolean, BindingOrigin::Inferred)
            .unwrap_err();
        assert!(matches!(err, BindError::Conflict { .. }));
        assert_eq!(registry.get(&SourceKey::dp(1)).unwrap().capability, "measure_temperature");
    }

    #[test]
    fn test_inferred_overwrites_inferred() {
        let registry = BindingRegistry::new("dev");
        let key = SourceKey::attribute(1, 0x0402, "measuredValue");
        registry
            .bind(key.clone(), "a", ValueTransform::Identity, BindingOrigin::Inferred)
            .unwrap();
        let previous = registry
            .bind(key.clone(), "b", ValueTransform::Identity, BindingOrigin::Inferred)
            .unwrap();
        assert_eq!(previous.unwrap().capability, "a");
        assert_eq!(registry.get(&key).unwrap().capability, "b");
    }

    #[test]
    fn test_non_finite_resolves_to_none() {
        let registry = BindingRegistry::new("dev");
        registry
            .bind(SourceKey::dp(2), "x", ValueTransform::divide(0.0), BindingOrigin::Declared)
            .unwrap();
        assert!(registry.resolve(&SourceKey::dp(2), &AttributeValue::Int(3)).is_none());
    }

    #[test]
    fn test_unbound_key_resolves_to_none() {
        let registry = BindingRegistry::new("dev");
        assert!(registry.resolve(&SourceKey::dp(99), &AttributeValue::Int(3)).is_none());
    }

    #[test]
    fn test_ambiguous_key_guesses_declared_capability() {
        let registry = BindingRegistry::new("dev")
            .with_declared_capabilities(["measure_temperature", "measure_humidity"]);

        let res = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(215)).unwrap();
        assert_eq!(res.capability, "measure_temperature");
        assert_eq!(res.value, CapabilityValue::Number(21.5));
        assert!(res.low_confidence);

        let binding = registry.get(&SourceKey::dp(1)).unwrap();
        assert_eq!(binding.origin, BindingOrigin::Inferred);
    }

    #[test]
    fn test_contact_or_humidity_key_follows_value_shape() {
        let registry = BindingRegistry::new("dev")
            .with_declared_capabilities(["alarm_contact", "measure_humidity"]);
        let res = registry.resolve(&SourceKey::dp(2), &AttributeValue::Int(55)).unwrap();
        assert_eq!(res.capability, "measure_humidity");
        assert_eq!(res.value, CapabilityValue::Number(55.0));
        assert!(res.low_confidence);

        let registry = BindingRegistry::new("dev").with_declared_capabilities(["alarm_contact"]);
        let res = registry.resolve(&SourceKey::dp(2), &AttributeValue::Int(1)).unwrap();
        assert_eq!(res.capability, "alarm_contact");
        assert_eq!(res.value, CapabilityValue::Bool(true));
        assert_eq!(registry.get(&SourceKey::dp(2)).unwrap().origin, BindingOrigin::Inferred);
    }

    #[test]
    fn test_ambiguous_guess_requires_declared_capability() {
        let registry = BindingRegistry::new("dev").with_declared_capabilities(["measure_temperature"]);
        // Boolean-like value points to alarm_motion, which the device lacks.
        assert!(registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(1)).is_none());
        assert!(!registry.contains(&SourceKey::dp(1)));
    }

    #[test]
    fn test_contradicted_boolean_guess_is_rebound() {
        let registry = BindingRegistry::new("dev")
            .with_declared_capabilities(["alarm_motion", "measure_temperature"]);

        let first = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(0)).unwrap();
        assert_eq!(first.capability, "alarm_motion");

        let second = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(231)).unwrap();
        assert_eq!(second.capability, "measure_temperature");
        assert_eq!(second.value, CapabilityValue::Number(23.1));
    }

    #[test]
    fn test_declared_ambiguous_key_is_unconditional() {
        let registry = BindingRegistry::new("dev")
            .with_declared_capabilities(["alarm_motion", "measure_temperature"]);
        registry
            .bind(SourceKey::dp(1), "alarm_motion", ValueTransform::Boolean, BindingOrigin::Declared)
            .unwrap();

        let res = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(231)).unwrap();
        assert_eq!(res.capability, "alarm_motion");
        assert_eq!(res.value, CapabilityValue::Bool(true));
    }

    #[test]
    fn test_unbind_drops_declared_binding() {
        let registry = BindingRegistry::new("dev");
        registry
            .bind(SourceKey::dp(4), "measure_battery", ValueTransform::Identity, BindingOrigin::Declared)
            .unwrap();
        let removed = registry.unbind(&SourceKey::dp(4)).unwrap();
        assert_eq!(removed.capability, "measure_battery");
        assert!(registry.is_empty());
        assert!(registry.resolve(&SourceKey::dp(4), &AttributeValue::Int(80)).is_none());
    }

    #[test]
    fn test_revert_leaves_newer_binding_alone() {
        let registry = BindingRegistry::new("dev");
        let key = SourceKey::attribute(1, 0x0402, "measuredValue");
        let ours = CapabilityBinding::inferred(key.clone(), "measure_temperature", ValueTransform::divide(100.0));
        let previous = registry.insert(ours.clone()).unwrap();
        assert!(previous.is_none());

        registry
            .bind(key.clone(), "measure_temperature", ValueTransform::Identity, BindingOrigin::Declared)
            .unwrap();
        assert!(!registry.revert(&ours, previous));
        assert_eq!(registry.get(&key).unwrap().origin, BindingOrigin::Declared);
    }

    #[test]
    fn test_revert_restores_previous_binding() {
        let registry = BindingRegistry::new("dev");
        let key = SourceKey::attribute(1, 0x0402, "measuredValue");
        registry
            .bind(key.clone(), "a", ValueTransform::Identity, BindingOrigin::Inferred)
            .unwrap();
        let ours = CapabilityBinding::inferred(key.clone(), "b", ValueTransform::Identity);
        let previous = registry.insert(ours.clone()).unwrap();

        assert!(registry.revert(&ours, previous));
        assert_eq!(registry.get(&key).unwrap().capability, "a");

        let fresh = CapabilityBinding::inferred(SourceKey::dp(7), "c", ValueTransform::Identity);
        registry.insert(fresh.clone()).unwrap();
        assert!(registry.revert(&fresh, None));
        assert!(!registry.contains(&SourceKey::dp(7)));
    }

    #[test]
    fn test_bindings_for_orders_declared_first() {
        let registry = BindingRegistry::new("dev");
        registry
            .bind(SourceKey::attribute(1, 6, "onOff"), "onoff", ValueTransform::Boolean, BindingOrigin::Inferred)
            .unwrap();
        registry
            .bind(SourceKey::dp(1), "onoff", ValueTransform::Boolean, BindingOrigin::Declared)
            .unwrap();
        let found = registry.bindings_for("onoff");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].origin, BindingOrigin::Declared);
    }

    #[test]
    fn test_concurrent_bind_and_resolve() {
        use std::sync::Arc;

        let registry = Arc::new(
            BindingRegistry::new("dev").with_declared_capabilities(["measure_temperature"]),
        );
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..200i64 {
                        let key = SourceKey::dp(100 + i);
                        let _ = registry.bind(key.clone(), "x", ValueTransform::Identity, BindingOrigin::Inferred);
                        let _ = registry.resolve(&key, &AttributeValue::Int(n));
                        let _ = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(200 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 9);
    }

    proptest! {
        #[test]
        fn prop_declared_binding_is_stable(
            proposals in prop::collection::vec(
                prop::sample::select(vec!["alarm_motion", "measure_battery", "onoff"]),
                0..20,
            ),
            raw in any::<i32>(),
        ) {
            let registry = BindingRegistry::new("dev")
                .with_declared_capabilities(["alarm_motion", "measure_temperature"]);
            registry
                .bind(SourceKey::dp(1), "measure_temperature", ValueTransform::divide(10.0), BindingOrigin::Declared)
                .unwrap();

            for capability in proposals {
                let result = registry.bind(SourceKey::dp(1), capability, ValueTransform::Boolean, BindingOrigin::Inferred);
                prop_assert!(result.is_err());
            }

            let res = registry.resolve(&SourceKey::dp(1), &AttributeValue::Int(raw as i64)).unwrap();
            prop_assert_eq!(res.capability, "measure_temperature");
        }
    }
}
