use kube::CustomResourceExt;
use mariadb_failover::crd::MariaDbCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&MariaDbCluster::crd())?);
    Ok(())
}
