//! CRD YAML Generator
//!
//! Prints the Kubernetes CRD manifests for every custom resource the
//! kaspr-operator serves.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use kaspr_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
