//! `kubearchive rbac` — lists every `ClusterPolicy`/`NamespacePolicy`
//! object in the live cluster, reduces them into a [`FilterStore`]
//! snapshot, and prints the reconciled RBAC manifests (`spec.md` §4.7)
//! to stdout as YAML, the same read-and-render shape as `commands::crd`.

use anyhow::Result;
use kube::api::ListParams;
use kube::{Api, Client};

use kubearchive::config::Config;
use kubearchive::filterstore::{reduce, FilterStore, PolicyChange};
use kubearchive::policy::{ClusterPolicy, NamespacePolicy};
use kubearchive::rbac::{cluster_read_role, cluster_role_binding, namespace_delete_role, namespace_delete_role_binding};

const VACUUM_SERVICE_ACCOUNT_NAME: &str = "kubearchive-vacuum";

pub async fn run() -> Result<()> {
    let client = Client::try_default().await?;
    let config = Config::default();

    let mut store = FilterStore::default();

    let cluster_policies: Api<ClusterPolicy> = Api::all(client.clone());
    for cp in cluster_policies.list(&ListParams::default()).await?.items {
        store = reduce(&store, &PolicyChange::ClusterUpserted(cp.spec));
    }

    let namespace_policies: Api<NamespacePolicy> = Api::all(client.clone());
    for np in namespace_policies.list(&ListParams::default()).await?.items {
        let namespace = np.metadata.namespace.clone().unwrap_or_default();
        store = reduce(&store, &PolicyChange::NamespaceUpserted { namespace, spec: np.spec });
    }

    println!("{}", serde_yaml::to_string(&cluster_read_role(&store))?);

    let vacuum_identities: Vec<(String, String)> =
        vec![(VACUUM_SERVICE_ACCOUNT_NAME.to_string(), config.operator_namespace.clone())];
    println!("---");
    println!("{}", serde_yaml::to_string(&cluster_role_binding(&vacuum_identities))?);

    for namespace in store.namespaces.keys() {
        if let Some(role) = namespace_delete_role(&store, namespace) {
            println!("---");
            println!("{}", serde_yaml::to_string(&role)?);
            println!("---");
            println!(
                "{}",
                serde_yaml::to_string(&namespace_delete_role_binding(namespace, VACUUM_SERVICE_ACCOUNT_NAME))?
            );
        }
    }

    Ok(())
}
