//! Device engine for DataPoint overlay and native attribute devices.
//!
//! Decodes proprietary DataPoint frames, decides per device whether the
//! overlay, the native clusters or both are used, maps raw values onto
//! capabilities and discovers extra capabilities at runtime.
//!
//! ```text
//! InboundBus ──> DeviceContext ──> codec ──> BindingRegistry ──> CapabilitySink
//!                     │                           ^
//!                     ├── Classifier              │
//!                     └── EnrichmentScanner ──────┘  (via resilience)
//! ```

pub mod binding;
pub mod classifier;
pub mod codec;
pub mod commands;
pub mod config;
pub mod context;
pub mod enrichment;
pub mod ias_zone;
pub mod identity;
pub mod manager;
pub mod profiles;
pub mod resilience;
pub mod role;
pub mod transform;

pub use binding::{
    AmbiguityTable, BindError, BindingOrigin, BindingRegistry, CapabilityBinding, Resolution,
    SourceKey,
};
pub use classifier::{ClassificationRule, Classifier, ClassifierRules, Protocol, ProtocolDecision};
pub use codec::{DataPointFrame, DecodeError, DecodeReport, DpType, DpValue, EncodeError};
pub use commands::{Envelope, CRITICAL_DATA_POINTS};
pub use config::{ConfigError, EngineConfig, HybridConfig, OverlayConfig, ScanConfig};
pub use context::{Collaborators, DeviceContext, DeviceError, HandleReport};
pub use enrichment::{
    EnrichmentRecord, EnrichmentScanner, ScanError, ScanReport, ScanState, SkipReason,
    TrustPolicy, TrustTier,
};
pub use identity::DeviceIdentity;
pub use manager::DeviceManager;
pub use profiles::DeviceProfile;
pub use resilience::{
    with_retry, FailureReason, FallbackSource, Liveness, OperationOutcome, RetryPolicy,
};
pub use role::DeviceRole;
pub use transform::ValueTransform;
