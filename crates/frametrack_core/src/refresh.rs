use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::catalog::{
    Catalog, Category, Item, display_name, item_id, load_catalog, normalize_name, render_catalog,
};
use crate::config::TrackerConfig;

/// One tracked entry as read from an upstream source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub category: Category,
    pub name: String,
    pub url: Option<String>,
}

pub trait DatasetSource {
    fn describe(&self) -> String;
    fn fetch_entries(&mut self) -> Result<Vec<RawEntry>>;
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub dataset_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl HttpSourceConfig {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            dataset_url: config.dataset_url(),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
        }
    }
}

/// Downloads the community item data set as one JSON document.
pub struct HttpDatasetSource {
    client: Client,
    config: HttpSourceConfig,
}

impl HttpDatasetSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build data set HTTP client")?;
        Ok(Self { client, config })
    }
}

impl DatasetSource for HttpDatasetSource {
    fn describe(&self) -> String {
        self.config.dataset_url.clone()
    }

    fn fetch_entries(&mut self) -> Result<Vec<RawEntry>> {
        let url = Url::parse(&self.config.dataset_url)
            .with_context(|| format!("invalid data set URL: {}", self.config.dataset_url))?;
        info!(url = %url, "fetching data set");
        let response = self
            .client
            .get(url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .send()
            .with_context(|| format!("failed to fetch data set from {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("failed to fetch data set from {url}: HTTP {status}");
        }
        let payload: Value = response
            .json()
            .with_context(|| format!("unexpected data set structure at {url}: invalid JSON"))?;
        parse_dataset(&payload)
    }
}

/// Reads the plain-text lists (`<slug>.txt`, one name per line) kept by older installs.
pub struct ListDirectorySource {
    dir: PathBuf,
}

impl ListDirectorySource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl DatasetSource for ListDirectorySource {
    fn describe(&self) -> String {
        format!("lists:{}", self.dir.display())
    }

    fn fetch_entries(&mut self) -> Result<Vec<RawEntry>> {
        if !self.dir.is_dir() {
            bail!("list directory {} does not exist", self.dir.display());
        }
        let mut entries = Vec::new();
        for category in Category::ALL {
            let path = self.dir.join(format!("{}.txt", category.slug()));
            if !path.exists() {
                debug!(path = %path.display(), "list file missing, skipping");
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            entries.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| RawEntry {
                        category,
                        name: display_name(line),
                        url: None,
                    }),
            );
        }
        if entries.is_empty() {
            bail!("no item names found in {}", self.dir.display());
        }
        Ok(entries)
    }
}

/// Extract tracked entries from the community data set.
pub fn parse_dataset(payload: &Value) -> Result<Vec<RawEntry>> {
    let records = payload.as_array().ok_or_else(|| {
        anyhow::anyhow!("unexpected data set structure: top-level value is not an array")
    })?;

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for record in records {
        let Some(category) = record
            .get("category")
            .and_then(Value::as_str)
            .and_then(Category::from_label)
        else {
            skipped += 1;
            continue;
        };
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if name.is_empty() {
            skipped += 1;
            continue;
        }
        let url = record
            .get("wikiaUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| value.starts_with("https://") || value.starts_with("http://"))
            .map(ToString::to_string);
        entries.push(RawEntry {
            category,
            name: name.to_string(),
            url,
        });
    }

    debug!(
        records = records.len(),
        tracked = entries.len(),
        skipped,
        "parsed data set"
    );
    if entries.is_empty() {
        bail!(
            "unexpected data set structure: none of {} records belong to a tracked category",
            records.len()
        );
    }
    Ok(entries)
}

pub fn build_catalog(
    entries: Vec<RawEntry>,
    wiki_base_url: &str,
    source: Option<String>,
) -> Result<Catalog> {
    let mut by_id = BTreeMap::new();
    for entry in entries {
        let name = display_name(&entry.name);
        if name.is_empty() {
            continue;
        }
        let id = item_id(entry.category, &name);
        if by_id.contains_key(&id) {
            continue;
        }
        let url = match entry.url {
            Some(url) => url,
            None => wiki_url_for(wiki_base_url, &name)?,
        };
        by_id.insert(
            id.clone(),
            Item {
                id,
                name,
                category: entry.category,
                url,
            },
        );
    }

    let mut items = by_id.into_values().collect::<Vec<_>>();
    items.sort_by(|left, right| {
        left.category
            .cmp(&right.category)
            .then_with(|| left.name.to_lowercase().cmp(&right.name.to_lowercase()))
            .then_with(|| left.name.cmp(&right.name))
    });
    Ok(Catalog { source, items })
}

pub fn wiki_url_for(wiki_base_url: &str, name: &str) -> Result<String> {
    let mut url = Url::parse(wiki_base_url.trim())
        .with_context(|| format!("invalid wiki URL: {wiki_base_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("wiki URL cannot be a base: {wiki_base_url}"))?
        .pop_if_empty()
        .push(&normalize_name(name));
    Ok(url.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub source: String,
    pub resources_path: String,
    pub total_items: usize,
    pub by_category: BTreeMap<String, usize>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub previous_hash: Option<String>,
    pub content_hash: String,
    pub changed: bool,
}

/// Fetch, rebuild and atomically replace the resource file.
///
/// Nothing touches `resources_path` until the new catalog is fully built and
/// written to a sibling temporary file, so a failed refresh keeps the last good copy.
pub fn refresh(
    source: &mut dyn DatasetSource,
    resources_path: &Path,
    wiki_base_url: &str,
) -> Result<RefreshReport> {
    let description = source.describe();
    let entries = source.fetch_entries()?;
    let catalog = build_catalog(entries, wiki_base_url, Some(description.clone()))?;
    let rendered = render_catalog(&catalog)?;

    let previous_bytes = if resources_path.exists() {
        Some(
            fs::read(resources_path)
                .with_context(|| format!("failed to read {}", resources_path.display()))?,
        )
    } else {
        None
    };
    let previous_ids = match load_catalog(resources_path) {
        Ok(Some(previous)) => previous
            .items
            .into_iter()
            .map(|item| item.id)
            .collect::<BTreeSet<_>>(),
        Ok(None) => BTreeSet::new(),
        Err(error) => {
            let message = format!("{error:#}");
            warn!(error = %message, "previous resource file unreadable; replacing");
            BTreeSet::new()
        }
    };
    let current_ids = catalog
        .items
        .iter()
        .map(|item| item.id.clone())
        .collect::<BTreeSet<_>>();

    let previous_hash = previous_bytes.as_deref().map(compute_hash);
    let content_hash = compute_hash(rendered.as_bytes());
    let changed = previous_hash.as_deref() != Some(content_hash.as_str());
    if changed {
        write_atomically(resources_path, rendered.as_bytes())?;
    }

    let mut by_category = BTreeMap::new();
    for category in Category::ALL {
        by_category.insert(category.label().to_string(), catalog.count_in(category));
    }
    info!(
        items = catalog.items.len(),
        changed,
        path = %resources_path.display(),
        "resource refresh complete"
    );

    Ok(RefreshReport {
        source: description,
        resources_path: resources_path.to_string_lossy().replace('\\', "/"),
        total_items: catalog.items.len(),
        by_category,
        added: current_ids.difference(&previous_ids).cloned().collect(),
        removed: previous_ids.difference(&current_ids).cloned().collect(),
        previous_hash,
        content_hash,
        changed,
    })
}

fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);

    let result = fs::write(&temp_path, content)
        .with_context(|| format!("failed to write {}", temp_path.display()))
        .and_then(|()| {
            fs::rename(&temp_path, path).with_context(|| {
                format!(
                    "failed to replace {} with {}",
                    path.display(),
                    temp_path.display()
                )
            })
        });
    if result.is_err() && temp_path.is_file() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn compute_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
