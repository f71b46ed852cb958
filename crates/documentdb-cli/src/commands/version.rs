use anyhow::Result;

/// Set at build time through `DOCUMENTDB_PLUGIN_VERSION`.
pub const PLUGIN_VERSION: &str = match option_env!("DOCUMENTDB_PLUGIN_VERSION") {
    Some(version) => version,
    None => "dev",
};

pub fn run() -> Result<()> {
    println!("kubectl-documentdb version {PLUGIN_VERSION}");
    Ok(())
}
