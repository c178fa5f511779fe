use anyhow::Result;
use clap::Parser;
use repogen::{Enricher, extract_manifests, patch_last_updated, trim_manifest, write_catalog};
use std::path::Path;

/// Directory tree scanned for `<plugin>/latest.zip` release archives.
const PLUGIN_ROOT: &str = "plugins";

#[derive(Parser)]
#[command(name = "repogen", about = "Build the plugin repository catalog")]
struct Cli {
    /// GitHub repository the download and icon URLs point into.
    #[arg(long, default_value = "owner/reponame")]
    repo: String,

    /// Catalog file to write.
    #[arg(long = "file_name", short = 'f', default_value = "repo.json")]
    file_name: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("Scanning {} for release archives", PLUGIN_ROOT);
    let manifests = extract_manifests(Path::new(PLUGIN_ROOT))?;

    let enricher = Enricher::new(&cli.repo);
    let mut catalog: Vec<_> = manifests.iter().map(trim_manifest).collect();
    for manifest in &mut catalog {
        enricher.apply(manifest)?;
    }

    write_catalog(Path::new(&cli.file_name), &catalog)?;
    println!("Wrote {} manifests to {}", catalog.len(), cli.file_name);

    println!("Refreshing LastUpdated timestamps");
    let refreshed = patch_last_updated(Path::new(&cli.file_name), Path::new(PLUGIN_ROOT))?;
    println!("Refreshed {} entries", refreshed);

    Ok(())
}
