//! Custom Resource Definitions for the Stash operator

mod recovery;
mod restic;
mod shared;

pub use recovery::*;
pub use restic::*;
pub use shared::*;

use kube::CustomResourceExt;

/// API group of every Stash resource
pub const GROUP: &str = "stash.appscode.com";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![
        serde_yaml::to_string(&Restic::crd()).unwrap(),
        serde_yaml::to_string(&Recovery::crd()).unwrap(),
    ]
}
