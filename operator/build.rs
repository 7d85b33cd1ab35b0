use kube::CustomResourceExt;
use std::fs;
use stratus_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/autoscaling.stratus.dev_nodepool_crd.yaml",
        serde_yaml::to_string(&NodePool::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/autoscaling.stratus.dev_nodeclaim_crd.yaml",
        serde_yaml::to_string(&NodeClaim::crd()).unwrap(),
    )
    .unwrap();
}
