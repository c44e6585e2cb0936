use kube::CustomResourceExt;
use rustrial_k8s_tenant_controller_apis::{SyncWindow, Tenant};
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Tenant::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&SyncWindow::crd()).unwrap());
}
