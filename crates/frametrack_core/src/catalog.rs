use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Tracked item categories, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Warframes,
    Primary,
    Secondary,
    Melee,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Warframes,
        Category::Primary,
        Category::Secondary,
        Category::Melee,
    ];

    /// Label used by the upstream data set and in the resource file.
    pub fn label(self) -> &'static str {
        match self {
            Self::Warframes => "Warframes",
            Self::Primary => "Primary",
            Self::Secondary => "Secondary",
            Self::Melee => "Melee",
        }
    }

    /// Stable lowercase slug; also the stem of the legacy list files.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Warframes => "warframes",
            Self::Primary => "primaries",
            Self::Secondary => "secondaries",
            Self::Melee => "melees",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.label() == value)
    }

    /// Accepts a label or a slug, case-insensitively.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        for category in Self::ALL {
            if trimmed.eq_ignore_ascii_case(category.label())
                || trimmed.eq_ignore_ascii_case(category.slug())
            {
                return Ok(category);
            }
        }
        bail!(
            "unknown category: {trimmed} (expected one of {})",
            Self::ALL
                .iter()
                .map(|category| category.label())
                .collect::<Vec<_>>()
                .join("|")
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub url: String,
}

impl Item {
    /// First letter used for grouping in the terminal lookup.
    pub fn initial(&self) -> char {
        initial_of(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub category: Option<Category>,
    pub name: Option<String>,
}

impl ItemFilter {
    pub fn matches(&self, item: &Item) -> bool {
        if let Some(category) = self.category
            && item.category != category
        {
            return false;
        }
        match self.name.as_deref() {
            Some(needle) if !needle.trim().is_empty() => item
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self
                .name
                .as_deref()
                .map(|name| name.trim().is_empty())
                .unwrap_or(true)
    }
}

impl Catalog {
    pub fn categories(&self) -> Vec<Category> {
        self.items
            .iter()
            .map(|item| item.category)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn filter(&self, filter: &ItemFilter) -> Vec<&Item> {
        self.items.iter().filter(|item| filter.matches(item)).collect()
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &Item> {
        self.items
            .iter()
            .filter(move |item| item.category == category)
    }

    pub fn starting_letters(&self, category: Category) -> Vec<char> {
        self.in_category(category)
            .map(Item::initial)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn items_starting_with(&self, category: Category, letter: char) -> Vec<&Item> {
        let letter = uppercase_letter(letter);
        self.in_category(category)
            .filter(|item| item.initial() == letter)
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Spaces and underscores are equivalent; case is ignored.
    pub fn find_by_name(&self, name: &str) -> Option<&Item> {
        let wanted = name_key(name);
        if wanted.is_empty() {
            return None;
        }
        self.items.iter().find(|item| name_key(&item.name) == wanted)
    }

    pub fn count_in(&self, category: Category) -> usize {
        self.in_category(category).count()
    }
}

/// Load the resource file. Returns `None` when it has not been written yet.
pub fn load_catalog(path: &Path) -> Result<Option<Catalog>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let catalog: Catalog = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(catalog))
}

/// Like [`load_catalog`] but fails with a hint when the resource file is missing.
pub fn require_catalog(path: &Path) -> Result<Catalog> {
    match load_catalog(path)? {
        Some(catalog) => Ok(catalog),
        None => bail!(
            "resource file {} does not exist; run `frametrack refresh` first",
            path.display()
        ),
    }
}

/// Deterministic rendering used for the resource file.
pub fn render_catalog(catalog: &Catalog) -> Result<String> {
    let mut rendered =
        serde_json::to_string_pretty(catalog).context("failed to serialize item catalog")?;
    rendered.push('\n');
    Ok(rendered)
}

/// In-game names use spaces; identifiers and wiki paths use underscores.
pub fn normalize_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

pub fn display_name(name: &str) -> String {
    name.trim().replace('_', " ")
}

pub fn item_id(category: Category, name: &str) -> String {
    format!("{}/{}", category.slug(), normalize_name(name))
}

fn name_key(name: &str) -> String {
    display_name(name).to_lowercase()
}

fn initial_of(name: &str) -> char {
    match name.trim().chars().next() {
        Some(ch) if ch.is_alphabetic() => uppercase_letter(ch),
        _ => '#',
    }
}

fn uppercase_letter(ch: char) -> char {
    ch.to_uppercase().next().unwrap_or(ch)
}
