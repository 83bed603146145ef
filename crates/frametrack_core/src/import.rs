use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::progress::{ProgressMap, mark_owned};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkImportReport {
    pub requested: usize,
    pub matched: Vec<String>,
    pub unmatched: Vec<String>,
}

/// One item name per line; surrounding whitespace and blank lines are ignored.
pub fn parse_name_list(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(ToString::to_string)
        .collect()
}

pub fn read_name_list(path: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
    Ok(parse_name_list(&text))
}

/// Mark every listed item as owned and completed. Unknown names are reported, not rejected.
pub fn apply_bulk_import(
    progress: &mut ProgressMap,
    catalog: &Catalog,
    names: &[String],
) -> BulkImportReport {
    let mut matched = BTreeSet::new();
    let mut unmatched = Vec::new();
    for name in names {
        match catalog.find_by_name(name) {
            Some(item) => {
                matched.insert(item.id.clone());
            }
            None => unmatched.push(name.clone()),
        }
    }
    mark_owned(progress, matched.iter().map(String::as_str));

    BulkImportReport {
        requested: names.len(),
        matched: matched.into_iter().collect(),
        unmatched,
    }
}
