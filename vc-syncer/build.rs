use kube::CustomResourceExt;
use std::fs;
use vc_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/vcluster.io_virtualclusters_crd.yaml",
        serde_yaml::to_string(&VirtualCluster::crd()).unwrap(),
    )
    .unwrap();
}
