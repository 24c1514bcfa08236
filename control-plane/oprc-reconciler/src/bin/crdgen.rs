use kube::core::CustomResourceExt;
use oprc_reconciler::crd::AppStack;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&AppStack::crd())?;
    println!("{}", yaml);
    Ok(())
}
