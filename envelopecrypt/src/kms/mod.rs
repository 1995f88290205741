//! Key Management Service implementations for the application encryption library
//!
//! - `StaticKeyManagementService` wraps a single AEAD key for testing and single-region setups.
//! - `multi_region` provides the general-purpose multi-region KMS adapter; callers supply a
//!   `RegionalKmsClient` per region (e.g. talking to a concrete cloud provider's SDK).
//! - Custom KMS implementations can be added by implementing the `KeyManagementService` trait.

mod multi_region;
mod static_kms;

pub use multi_region::{
    GenerateDataKeyResponse, MultiRegionKms, MultiRegionKmsBuilder, RegionalClient,
    RegionalKmsClient,
};
pub use static_kms::StaticKeyManagementService;
