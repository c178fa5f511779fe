//! Pipeline for building a plugin repository catalog.
//!
//! A plugin repository is a directory tree where each plugin ships as
//! `plugins/<InternalName>/latest.zip`, carrying its manifest inside the
//! archive as `<InternalName>.json`. The pipeline extracts every manifest,
//! trims it to the published field set, fills in derived and defaulted
//! fields, and writes the result as one pretty-printed JSON catalog. A
//! final pass stamps each entry with the mtime of its archive.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value, json};
use walkdir::WalkDir;
use zip::ZipArchive;

/// A plugin manifest, kept as a raw JSON object. Its fields are defined by
/// the plugin build toolchain, not by us; we only project and augment them.
pub type Manifest = Map<String, Value>;

/// Name of the release archive expected in each plugin directory.
pub const ARCHIVE_NAME: &str = "latest.zip";

/// Manifest fields that survive trimming, in catalog output order.
pub const TRIMMED_KEYS: [&str; 9] = [
    "Author",
    "Name",
    "Description",
    "InternalName",
    "AssemblyVersion",
    "RepoUrl",
    "ApplicableVersion",
    "Tags",
    "DalamudApiLevel",
];

fn download_url(repo: &str, plugin_name: &str) -> String {
    format!("https://github.com/{repo}/raw/main/plugins/{plugin_name}/latest.zip")
}

fn icon_url(repo: &str, plugin_name: &str) -> String {
    format!("https://github.com/{repo}/raw/main/plugins/{plugin_name}/images/icon.png")
}

/// Walk `root` and parse the manifest out of every plugin archive found.
///
/// A directory counts as a plugin when it directly contains
/// [`ARCHIVE_NAME`]; the directory's own name is the plugin name and names
/// the manifest member inside the archive. Directories without the archive
/// are skipped. Result order follows the walk, which is not sorted and may
/// differ across platforms.
pub fn extract_manifests(root: &Path) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let archive_path = entry.path().join(ARCHIVE_NAME);
        if !archive_path.is_file() {
            continue;
        }

        let plugin_name = entry.file_name().to_string_lossy().to_string();
        println!("  Adding: {}", plugin_name);

        manifests.push(read_manifest(&archive_path, &plugin_name)?);
    }

    Ok(manifests)
}

fn read_manifest(archive_path: &Path, plugin_name: &str) -> Result<Manifest> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", archive_path.display()))?;

    let member = format!("{plugin_name}.json");
    let mut entry = archive
        .by_name(&member)
        .with_context(|| format!("{} has no member {}", archive_path.display(), member))?;

    let mut raw = String::new();
    entry
        .read_to_string(&mut raw)
        .with_context(|| format!("{} in {} is not UTF-8", member, archive_path.display()))?;

    serde_json::from_str(&raw)
        .with_context(|| format!("Malformed manifest {} in {}", member, archive_path.display()))
}

/// Project a raw manifest down to the published field set.
///
/// Fields outside [`TRIMMED_KEYS`] are dropped; fields from the list that
/// are absent are skipped without error.
pub fn trim_manifest(manifest: &Manifest) -> Manifest {
    TRIMMED_KEYS
        .iter()
        .filter_map(|&key| manifest.get(key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

/// Derived-field rules applied to every trimmed manifest.
///
/// The default and alias tables are plain data owned by the enricher so the
/// catalog schema can be read off in one place and the stage tested on its
/// own.
pub struct Enricher {
    repo: String,
    defaults: Vec<(&'static str, Value)>,
    aliases: Vec<(&'static str, Vec<&'static str>)>,
}

impl Enricher {
    pub fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            defaults: vec![
                ("IsHide", json!(false)),
                ("IsTestingExclusive", json!(false)),
                ("ApplicableVersion", json!("any")),
            ],
            aliases: vec![(
                "DownloadLinkInstall",
                vec!["DownloadLinkTesting", "DownloadLinkUpdate"],
            )],
        }
    }

    /// Add download and icon URLs, fill in defaults, duplicate link
    /// aliases, and reset the download counter.
    ///
    /// URLs are derived from `InternalName`, so a manifest without one is
    /// an error. Defaults and aliases never overwrite a field that is
    /// already present; `DownloadCount` is always overwritten.
    pub fn apply(&self, manifest: &mut Manifest) -> Result<()> {
        let plugin_name = manifest
            .get("InternalName")
            .and_then(Value::as_str)
            .context("Manifest has no InternalName")?
            .to_string();

        manifest.insert(
            "DownloadLinkInstall".to_string(),
            Value::String(download_url(&self.repo, &plugin_name)),
        );
        manifest.insert(
            "IconUrl".to_string(),
            Value::String(icon_url(&self.repo, &plugin_name)),
        );

        for (key, value) in &self.defaults {
            if !manifest.contains_key(*key) {
                manifest.insert((*key).to_string(), value.clone());
            }
        }

        // Alias fields read the freshly generated links, so this runs
        // after the URL step.
        for (source, targets) in &self.aliases {
            let value = manifest
                .get(*source)
                .cloned()
                .with_context(|| format!("Alias source {} missing", source))?;
            for target in targets {
                if !manifest.contains_key(*target) {
                    manifest.insert((*target).to_string(), value.clone());
                }
            }
        }

        manifest.insert("DownloadCount".to_string(), json!(0));

        Ok(())
    }
}

/// Serialize the catalog to `path` as a JSON array, pretty-printed with
/// the four-space indent the distribution clients expect. Any prior
/// content is truncated.
pub fn write_catalog(path: &Path, catalog: &[Manifest]) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    catalog.serialize(&mut ser)?;

    fs::write(path, buf).with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}

/// Re-read the catalog at `path` and refresh each record's `LastUpdated`
/// from the mtime of its archive under `plugins_root`, then rewrite the
/// file. Returns how many records changed.
///
/// A stored value is only replaced when it is absent or disagrees with the
/// file system, so re-running against unchanged archives leaves the file
/// byte-identical.
pub fn patch_last_updated(path: &Path, plugins_root: &Path) -> Result<usize> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut catalog: Vec<Manifest> = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed catalog {}", path.display()))?;

    let mut refreshed = 0;
    for manifest in &mut catalog {
        let plugin_name = manifest
            .get("InternalName")
            .and_then(Value::as_str)
            .context("Catalog record has no InternalName")?
            .to_string();

        let archive_path = plugins_root.join(&plugin_name).join(ARCHIVE_NAME);
        let modified = archive_mtime(&archive_path)?;

        let stale = match manifest.get("LastUpdated") {
            Some(value) => last_updated_secs(value)? != modified,
            None => true,
        };
        if stale {
            println!("  Updated: {} -> {}", plugin_name, format_timestamp(modified));
            manifest.insert("LastUpdated".to_string(), Value::String(modified.to_string()));
            refreshed += 1;
        }
    }

    write_catalog(path, &catalog)?;

    Ok(refreshed)
}

/// Unix mtime of `path` in whole seconds.
fn archive_mtime(path: &Path) -> Result<i64> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Missing plugin archive {}", path.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("No modification time for {}", path.display()))?;
    let secs = modified.duration_since(UNIX_EPOCH)?.as_secs();

    Ok(secs as i64)
}

// Stored as a string, but tolerate a bare number from hand-edited files.
fn last_updated_secs(value: &Value) -> Result<i64> {
    match value {
        Value::String(s) => s
            .parse()
            .with_context(|| format!("Malformed LastUpdated value {s:?}")),
        Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("Malformed LastUpdated value {n}")),
        other => bail!("Malformed LastUpdated value {other}"),
    }
}

fn format_timestamp(ts: i64) -> String {
    use chrono::DateTime;

    if let Some(datetime) = DateTime::from_timestamp(ts, 0) {
        datetime.format("%Y-%m-%d %H:%M").to_string()
    } else {
        "N/A".to_string()
    }
}
