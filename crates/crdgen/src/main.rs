use kube::CustomResourceExt as _;
use rac_database::api::v1::racdatabase::RacDatabase;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&RacDatabase::crd())?);
    Ok(())
}
