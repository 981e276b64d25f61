//! Prints the CodeServer CRD as YAML for `kubectl apply`.

use crds::CodeServer;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&CodeServer::crd())?);
    Ok(())
}
