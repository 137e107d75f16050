//! `kubearchive crd generate` — prints the `ClusterPolicy` and
//! `NamespacePolicy` CustomResourceDefinition YAML to stdout, grounded
//! on the teacher's `kube::CustomResourceExt::crd()` + `serde_yaml`
//! pattern in its own `src/crd.rs`.

use anyhow::Result;
use kube::CustomResourceExt;

use kubearchive::policy::{ClusterPolicy, NamespacePolicy};

pub fn run() -> Result<()> {
    let cluster_crd = ClusterPolicy::crd();
    println!("{}", serde_yaml::to_string(&cluster_crd)?);
    println!("---");
    let namespace_crd = NamespacePolicy::crd();
    println!("{}", serde_yaml::to_string(&namespace_crd)?);
    Ok(())
}
