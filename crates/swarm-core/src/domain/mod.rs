//! Domain model: manifest types, quantities, digests and the error taxonomy.

pub mod digest;
pub mod error;
pub mod manifest;
pub mod quantity;

pub use digest::{build_input_digest, canonical_json, ContentDigest};
pub use error::{DependencyCycleError, ManifestError, Result, SwarmError, Violation};
pub use manifest::{
    validate, AgentSpec, InfrastructureConfig, Project, RawManifest, RegistryConfig,
    RegistryKind, ResourceRequest, MANIFEST_FILE,
};
pub use quantity::{CpuQuantity, MemoryQuantity, QuantityError};
