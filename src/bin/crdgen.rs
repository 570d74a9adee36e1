//! CRD YAML Generator
//!
//! Prints the Restic and Recovery CustomResourceDefinitions.
//!
//! Usage: cargo run --bin crdgen > deploy/crds.yaml

use stash_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
