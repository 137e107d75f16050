use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};

use kubearchive::policy::{ClusterPolicy, NamespacePolicy};

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    print!("  List ClusterPolicy ........... ");
    let cluster_policies: Api<ClusterPolicy> = Api::all(client.clone());
    match cluster_policies.list(&ListParams::default()).await {
        Ok(l) => println!("OK ({} found)", l.items.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  List NamespacePolicy (all ns) . ");
    let namespace_policies: Api<NamespacePolicy> = Api::all(client.clone());
    match namespace_policies.list(&ListParams::default()).await {
        Ok(l) => println!("OK ({} found)", l.items.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Token review permission ...... ");
    let reviews: Api<TokenReview> = Api::all(client);
    let probe = TokenReview { spec: TokenReviewSpec { token: Some(String::new()), ..Default::default() }, ..Default::default() };
    match reviews.create(&PostParams::default(), &probe).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
