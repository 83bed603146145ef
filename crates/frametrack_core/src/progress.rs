use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{Catalog, Category};

const PROGRESS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS progress_entries (
    item_id TEXT PRIMARY KEY,
    blueprint INTEGER NOT NULL,
    completed INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#;

/// Per-item progress flags. Completion implies the blueprint is owned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub blueprint: bool,
    pub completed: bool,
}

impl ProgressEntry {
    pub const OWNED: ProgressEntry = ProgressEntry {
        blueprint: true,
        completed: true,
    };

    pub fn new(blueprint: bool, completed: bool) -> Self {
        Self {
            blueprint: blueprint || completed,
            completed,
        }
    }

    pub fn normalized(self) -> Self {
        Self::new(self.blueprint, self.completed)
    }
}

pub type ProgressMap = BTreeMap<String, ProgressEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub total: usize,
    pub changed: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressStore {
    db_path: PathBuf,
}

impl ProgressStore {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Returns an empty mapping when nothing has been saved yet.
    pub fn load(&self) -> Result<ProgressMap> {
        if !self.db_path.exists() {
            return Ok(ProgressMap::new());
        }
        let connection = open_connection(&self.db_path)?;
        if !table_exists(&connection, "progress_entries")? {
            return Ok(ProgressMap::new());
        }
        read_entries(&connection)
    }

    /// Replace the persisted mapping with `progress`.
    ///
    /// Rows whose flags are unchanged are not rewritten, so saving what was
    /// just loaded leaves the store untouched.
    pub fn save(&self, progress: &ProgressMap) -> Result<SaveReport> {
        if progress.is_empty() {
            if !self.db_path.exists() {
                return Ok(SaveReport::default());
            }
            let connection = open_connection(&self.db_path)?;
            if !table_exists(&connection, "progress_entries")? {
                return Ok(SaveReport::default());
            }
        }
        ensure_db_parent(&self.db_path)?;
        let mut connection = open_connection(&self.db_path)?;
        connection
            .execute_batch(PROGRESS_SCHEMA_SQL)
            .context("failed to initialize progress schema")?;
        let updated_at_unix =
            i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;

        let transaction = connection
            .transaction()
            .context("failed to start progress save transaction")?;
        let existing = read_entries(&transaction)?;

        let mut removed = 0usize;
        {
            let mut delete_statement = transaction
                .prepare("DELETE FROM progress_entries WHERE item_id = ?1")
                .context("failed to prepare progress_entries delete")?;
            for id in existing.keys().filter(|id| !progress.contains_key(*id)) {
                removed += delete_statement
                    .execute([id])
                    .with_context(|| format!("failed to delete progress for {id}"))?;
            }
        }

        let mut changed = 0usize;
        {
            let mut upsert_statement = transaction
                .prepare(
                    "INSERT INTO progress_entries (item_id, blueprint, completed, updated_at_unix)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(item_id) DO UPDATE SET
                        blueprint = excluded.blueprint,
                        completed = excluded.completed,
                        updated_at_unix = excluded.updated_at_unix",
                )
                .context("failed to prepare progress_entries upsert")?;
            for (id, entry) in progress {
                let entry = entry.normalized();
                if existing.get(id) == Some(&entry) {
                    continue;
                }
                upsert_statement
                    .execute(params![
                        id,
                        i64::from(entry.blueprint),
                        i64::from(entry.completed),
                        updated_at_unix,
                    ])
                    .with_context(|| format!("failed to store progress for {id}"))?;
                changed += 1;
            }
        }

        transaction
            .commit()
            .context("failed to commit progress save transaction")?;
        debug!(
            total = progress.len(),
            changed,
            removed,
            path = %self.db_path.display(),
            "progress saved"
        );

        Ok(SaveReport {
            total: progress.len(),
            changed,
            removed,
        })
    }
}

pub fn mark_owned<'a, I>(progress: &mut ProgressMap, ids: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let mut marked = 0usize;
    for id in ids {
        progress.insert(id.to_string(), ProgressEntry::OWNED);
        marked += 1;
    }
    marked
}

/// Identifiers with stored progress but no item in the catalog.
pub fn orphaned_ids(progress: &ProgressMap, catalog: &Catalog) -> Vec<String> {
    progress
        .keys()
        .filter(|id| catalog.find(id).is_none())
        .cloned()
        .collect()
}

pub fn prune_orphans(progress: &mut ProgressMap, catalog: &Catalog) -> Vec<String> {
    let orphans = orphaned_ids(progress, catalog);
    for id in &orphans {
        progress.remove(id);
    }
    orphans
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryProgress {
    pub total: usize,
    pub blueprint: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSummary {
    pub by_category: BTreeMap<Category, CategoryProgress>,
    pub orphaned: usize,
}

impl ProgressSummary {
    pub fn compute(catalog: &Catalog, progress: &ProgressMap) -> Self {
        let mut by_category = BTreeMap::new();
        for item in &catalog.items {
            let counts: &mut CategoryProgress = by_category.entry(item.category).or_default();
            counts.total += 1;
            if let Some(entry) = progress.get(&item.id) {
                let entry = entry.normalized();
                counts.blueprint += usize::from(entry.blueprint);
                counts.completed += usize::from(entry.completed);
            }
        }
        Self {
            by_category,
            orphaned: orphaned_ids(progress, catalog).len(),
        }
    }

    pub fn totals(&self) -> CategoryProgress {
        self.by_category
            .values()
            .fold(CategoryProgress::default(), |mut acc, counts| {
                acc.total += counts.total;
                acc.blueprint += counts.blueprint;
                acc.completed += counts.completed;
                acc
            })
    }
}

#[derive(Serialize)]
struct ProgressExport<'a> {
    progress: &'a ProgressMap,
}

/// Human-readable TOML dump, one `[progress."<id>"]` table per entry.
pub fn render_progress_toml(progress: &ProgressMap) -> Result<String> {
    let body = toml::to_string_pretty(&ProgressExport { progress })
        .context("failed to serialize progress as TOML")?;
    Ok(format!(
        "# frametrack progress export ({} entries)\n\n{body}",
        progress.len()
    ))
}

fn read_entries(connection: &Connection) -> Result<ProgressMap> {
    let mut statement = connection
        .prepare("SELECT item_id, blueprint, completed FROM progress_entries ORDER BY item_id ASC")
        .context("failed to prepare progress_entries query")?;
    let rows = statement
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let blueprint: i64 = row.get(1)?;
            let completed: i64 = row.get(2)?;
            Ok((id, ProgressEntry::new(blueprint != 0, completed != 0)))
        })
        .context("failed to run progress_entries query")?;

    let mut out = ProgressMap::new();
    for row in rows {
        let (id, entry) = row.context("failed to read progress_entries row")?;
        out.insert(id, entry);
    }
    Ok(out)
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    Ok(connection)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::catalog::{Item, item_id};

    fn catalog() -> Catalog {
        let item = |category: Category, name: &str| Item {
            id: item_id(category, name),
            name: name.to_string(),
            category,
            url: String::new(),
        };
        Catalog {
            source: None,
            items: vec![
                item(Category::Warframes, "Ember"),
                item(Category::Primary, "Paris Prime"),
                item(Category::Primary, "Soma"),
            ],
        }
    }

    #[test]
    fn load_returns_empty_map_without_creating_file() {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("data").join("progress.db"));
        assert!(store.load().expect("load").is_empty());
        assert!(!store.db_path().exists());

        let report = store.save(&ProgressMap::new()).expect("save empty");
        assert_eq!(report, SaveReport::default());
        assert!(!store.db_path().exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("data").join("progress.db"));
        let progress = ProgressMap::from([
            ("primaries/Paris_Prime".to_string(), ProgressEntry::new(true, true)),
            ("warframes/Ember".to_string(), ProgressEntry::new(true, false)),
            ("primaries/Soma".to_string(), ProgressEntry::new(false, false)),
        ]);

        let report = store.save(&progress).expect("save");
        assert_eq!(report.changed, 3);
        assert_eq!(store.load().expect("load"), progress);
    }

    #[test]
    fn saving_what_was_loaded_changes_nothing() {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("progress.db"));
        let progress = ProgressMap::from([
            ("primaries/Paris_Prime".to_string(), ProgressEntry::OWNED),
            ("warframes/Ember".to_string(), ProgressEntry::new(true, false)),
        ]);
        store.save(&progress).expect("save");

        let loaded = store.load().expect("load");
        let report = store.save(&loaded).expect("resave");
        assert_eq!(report.changed, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(store.load().expect("reload"), loaded);
    }

    #[test]
    fn saving_empty_load_leaves_foreign_database_untouched() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("progress.db");
        {
            let connection = Connection::open(&db_path).expect("open");
            connection
                .execute_batch("CREATE TABLE notes (body TEXT NOT NULL);")
                .expect("create");
        }
        let before = fs::read(&db_path).expect("read");

        let store = ProgressStore::new(&db_path);
        let loaded = store.load().expect("load");
        assert!(loaded.is_empty());
        let report = store.save(&loaded).expect("save");
        assert_eq!(report, SaveReport::default());

        assert_eq!(fs::read(&db_path).expect("read"), before);
        let connection = Connection::open(&db_path).expect("open");
        assert!(!table_exists(&connection, "progress_entries").expect("table check"));
    }

    #[test]
    fn save_overwrites_full_mapping() {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("progress.db"));
        store
            .save(&ProgressMap::from([
                ("a".to_string(), ProgressEntry::OWNED),
                ("b".to_string(), ProgressEntry::OWNED),
            ]))
            .expect("save");

        let report = store
            .save(&ProgressMap::from([(
                "b".to_string(),
                ProgressEntry::new(false, false),
            )]))
            .expect("save");
        assert_eq!(report.removed, 1);
        assert_eq!(report.changed, 1);
        assert_eq!(
            store.load().expect("load"),
            ProgressMap::from([("b".to_string(), ProgressEntry::default())])
        );
    }

    #[test]
    fn completed_implies_blueprint_when_stored() {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("progress.db"));
        store
            .save(&ProgressMap::from([(
                "warframes/Ember".to_string(),
                ProgressEntry {
                    blueprint: false,
                    completed: true,
                },
            )]))
            .expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded.get("warframes/Ember"), Some(&ProgressEntry::OWNED));
    }

    #[test]
    fn save_surfaces_io_failures() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "not a directory").expect("write");
        let store = ProgressStore::new(&blocker.join("progress.db"));
        let error = store
            .save(&ProgressMap::from([("a".to_string(), ProgressEntry::OWNED)]))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to create database parent directory"));
    }

    #[test]
    fn orphans_are_reported_and_pruned() {
        let catalog = catalog();
        let mut progress = ProgressMap::from([
            ("warframes/Ember".to_string(), ProgressEntry::OWNED),
            ("warframes/Removed_Frame".to_string(), ProgressEntry::OWNED),
        ]);
        assert_eq!(
            orphaned_ids(&progress, &catalog),
            vec!["warframes/Removed_Frame".to_string()]
        );
        let pruned = prune_orphans(&mut progress, &catalog);
        assert_eq!(pruned.len(), 1);
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn summary_counts_flags_per_category() {
        let catalog = catalog();
        let mut progress = ProgressMap::from([(
            "primaries/Soma".to_string(),
            ProgressEntry::new(true, false),
        )]);
        mark_owned(&mut progress, ["primaries/Paris_Prime", "stale/Thing"]);

        let summary = ProgressSummary::compute(&catalog, &progress);
        assert_eq!(
            summary.by_category.get(&Category::Primary),
            Some(&CategoryProgress {
                total: 2,
                blueprint: 2,
                completed: 1,
            })
        );
        assert_eq!(summary.orphaned, 1);
        assert_eq!(summary.totals().total, 3);
    }

    #[test]
    fn toml_export_is_human_readable() {
        let progress = ProgressMap::from([(
            "primaries/Paris_Prime".to_string(),
            ProgressEntry::OWNED,
        )]);
        let rendered = render_progress_toml(&progress).expect("render");
        assert!(rendered.starts_with("# frametrack progress export (1 entries)"));
        assert!(rendered.contains("primaries/Paris_Prime"));
        assert!(rendered.contains("completed = true"));

        let parsed: toml::Value = toml::from_str(&rendered).expect("parse export");
        let entry = parsed
            .get("progress")
            .and_then(|table| table.get("primaries/Paris_Prime"))
            .expect("entry");
        assert_eq!(entry.get("blueprint").and_then(toml::Value::as_bool), Some(true));
    }
}
