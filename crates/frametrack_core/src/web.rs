use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use tracing::{info, warn};
use url::Url;
use url::form_urlencoded;

use crate::catalog::{Catalog, Category, Item, ItemFilter};
use crate::import::{apply_bulk_import, parse_name_list};
use crate::progress::{ProgressEntry, ProgressMap, ProgressStore, ProgressSummary};

/// Form bodies larger than this are rejected with 413.
pub const MAX_FORM_BYTES: usize = 1024 * 1024;

const HTML: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, Copy)]
pub struct WebRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub body: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub location: Option<String>,
}

impl WebResponse {
    fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: HTML,
            body,
            location: None,
        }
    }

    fn redirect(location: String) -> Self {
        Self {
            status: 303,
            content_type: HTML,
            body: format!(
                "<a href=\"{}\">Continue</a>",
                escape_html(&location)
            ),
            location: Some(location),
        }
    }

    pub fn error_page(status: u16, title: &str, detail: &str) -> Self {
        let mut page = page_header(title);
        let _ = write!(
            page,
            "<p class=\"error\">{}</p><p><a href=\"/\">Back to the tracker</a></p>",
            escape_html(detail)
        );
        page.push_str(PAGE_FOOTER);
        Self::html(status, page)
    }
}

/// Page state shared by all requests: the catalog never changes while serving.
pub struct WebApp {
    catalog: Catalog,
    progress: ProgressStore,
}

impl WebApp {
    pub fn new(catalog: Catalog, progress: ProgressStore) -> Self {
        Self { catalog, progress }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn handle(&self, request: &WebRequest<'_>) -> WebResponse {
        let target = match Url::parse("http://localhost/").and_then(|base| base.join(request.url))
        {
            Ok(target) => target,
            Err(error) => {
                return WebResponse::error_page(400, "Bad request", &format!("invalid URL: {error}"));
            }
        };
        if target.path() != "/" {
            return WebResponse::error_page(
                404,
                "Not found",
                &format!("no page at {}", target.path()),
            );
        }

        let result = match request.method {
            "GET" | "HEAD" => self.index(&target),
            "POST" => self.submit(request.body),
            other => {
                return WebResponse::error_page(
                    405,
                    "Method not allowed",
                    &format!("{other} is not supported"),
                );
            }
        };
        match result {
            Ok(response) => response,
            Err(error) => {
                let detail = format!("{error:#}");
                warn!(error = %detail, "request failed");
                WebResponse::error_page(500, "Progress could not be stored", &detail)
            }
        }
    }

    fn index(&self, target: &Url) -> Result<WebResponse> {
        let query = Query::from_pairs(target.query_pairs());
        let filter = match query.filter() {
            Ok(filter) => filter,
            Err(error) => {
                return Ok(WebResponse::error_page(400, "Bad request", &error.to_string()));
            }
        };
        let progress = self.progress.load()?;
        Ok(WebResponse::html(
            200,
            render_index(&self.catalog, &progress, &filter, &query),
        ))
    }

    fn submit(&self, body: &str) -> Result<WebResponse> {
        let form = Query::from_pairs(form_urlencoded::parse(body.as_bytes()));
        match form.action.as_deref() {
            Some("save") => self.save(&form),
            Some("bulk_import") => self.bulk_import(&form),
            _ => Ok(WebResponse::error_page(
                400,
                "Bad request",
                "unknown form action",
            )),
        }
    }

    /// Replace the state of every item rendered on the page; items outside the
    /// current filter keep whatever was stored before.
    fn save(&self, form: &Query) -> Result<WebResponse> {
        let mut progress = self.progress.load()?;
        let mut updated = 0usize;
        for id in &form.shown {
            if self.catalog.find(id).is_none() {
                continue;
            }
            let entry = ProgressEntry::new(form.blueprint.contains(id), form.completed.contains(id));
            progress.insert(id.clone(), entry);
            updated += 1;
        }
        let report = self
            .progress
            .save(&progress)
            .context("failed to save progress")?;
        info!(updated, changed = report.changed, "progress form saved");
        Ok(WebResponse::redirect(form.back_location(&[])))
    }

    fn bulk_import(&self, form: &Query) -> Result<WebResponse> {
        let names = parse_name_list(form.items.as_deref().unwrap_or(""));
        let mut progress = self.progress.load()?;
        let report = apply_bulk_import(&mut progress, &self.catalog, &names);
        self.progress
            .save(&progress)
            .context("failed to save imported progress")?;
        info!(
            matched = report.matched.len(),
            unmatched = report.unmatched.len(),
            "bulk import applied"
        );
        Ok(WebResponse::redirect(form.back_location(&[
            ("imported", report.matched.len().to_string()),
            ("unmatched", report.unmatched.len().to_string()),
        ])))
    }
}

/// Query string or form fields the page understands.
#[derive(Debug, Default)]
struct Query {
    action: Option<String>,
    category: Option<String>,
    name: Option<String>,
    items: Option<String>,
    shown: Vec<String>,
    blueprint: BTreeSet<String>,
    completed: BTreeSet<String>,
    imported: Option<usize>,
    unmatched: Option<usize>,
}

impl Query {
    fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    {
        let mut query = Self::default();
        for (key, value) in pairs {
            let value = value.into_owned();
            match key.as_ref() {
                "_action" => query.action = Some(value),
                "category" => query.category = Some(value),
                "q" => query.name = Some(value),
                "items" => query.items = Some(value),
                "shown" => query.shown.push(value),
                "bp" => {
                    query.blueprint.insert(value);
                }
                "done" => {
                    query.completed.insert(value);
                }
                "imported" => query.imported = value.parse().ok(),
                "unmatched" => query.unmatched = value.parse().ok(),
                _ => {}
            }
        }
        query
    }

    fn filter(&self) -> Result<ItemFilter> {
        let category = match self.category.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) if value.eq_ignore_ascii_case("all") => None,
            Some(value) => Some(Category::parse(value)?),
        };
        Ok(ItemFilter {
            category,
            name: self
                .name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .map(ToString::to_string),
        })
    }

    fn back_location(&self, extra: &[(&str, String)]) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if let Some(category) = self.category.as_deref().filter(|value| !value.is_empty()) {
            serializer.append_pair("category", category);
        }
        if let Some(name) = self.name.as_deref().filter(|value| !value.is_empty()) {
            serializer.append_pair("q", name);
        }
        for (key, value) in extra {
            serializer.append_pair(key, value);
        }
        let encoded = serializer.finish();
        if encoded.is_empty() {
            "/".to_string()
        } else {
            format!("/?{encoded}")
        }
    }
}

const PAGE_FOOTER: &str = "</main></body></html>\n";

fn page_header(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"><title>{}</title><style>\
body{{font-family:sans-serif;margin:0;background:#f4f4f6}}main{{max-width:60rem;margin:auto;padding:1rem}}\
table{{border-collapse:collapse;width:100%;background:#fff;margin-bottom:1rem}}td,th{{padding:.25rem .5rem;border-bottom:1px solid #ddd;text-align:left}}\
.notice{{background:#e6f4ea;padding:.5rem}}.error{{background:#fce8e6;padding:.5rem}}.empty{{font-style:italic}}\
</style></head><body><main><h1>{}</h1>\n",
        escape_html(title),
        escape_html(title)
    )
}

fn render_index(
    catalog: &Catalog,
    progress: &ProgressMap,
    filter: &ItemFilter,
    query: &Query,
) -> String {
    let summary = ProgressSummary::compute(catalog, progress);
    let totals = summary.totals();
    let mut page = page_header("Frametrack");
    let _ = writeln!(
        page,
        "<p>{} of {} items completed, {} blueprints owned.</p>",
        totals.completed, totals.total, totals.blueprint
    );

    if let Some(imported) = query.imported {
        let _ = writeln!(
            page,
            "<p class=\"notice\">Imported {imported} items; {} names were not recognised.</p>",
            query.unmatched.unwrap_or(0)
        );
    }

    render_filter_form(&mut page, catalog, filter);

    let items = catalog.filter(filter);
    if items.is_empty() {
        page.push_str("<p class=\"empty\">No items match the current filters.</p>\n");
    } else {
        render_progress_form(&mut page, &items, progress, &summary, filter);
    }

    page.push_str(
        "<h2>Bulk import</h2>\n<form method=\"post\" action=\"/\">\
<input type=\"hidden\" name=\"_action\" value=\"bulk_import\">\
<p>One item name per line. Matching items are marked as owned and completed.</p>\
<textarea name=\"items\" rows=\"6\" cols=\"40\"></textarea><br>\
<button type=\"submit\">Import</button></form>\n",
    );
    page.push_str(PAGE_FOOTER);
    page
}

fn render_filter_form(page: &mut String, catalog: &Catalog, filter: &ItemFilter) {
    page.push_str("<form method=\"get\" action=\"/\"><select name=\"category\"><option value=\"\">All categories</option>");
    for category in catalog.categories() {
        let selected = if filter.category == Some(category) {
            " selected"
        } else {
            ""
        };
        let _ = write!(
            page,
            "<option value=\"{label}\"{selected}>{label}</option>",
            label = category.label()
        );
    }
    let _ = writeln!(
        page,
        "</select> <input type=\"search\" name=\"q\" placeholder=\"Name contains\" value=\"{}\"> \
<button type=\"submit\">Filter</button> <a href=\"/\">Clear</a></form>",
        escape_html(filter.name.as_deref().unwrap_or(""))
    );
}

fn render_progress_form(
    page: &mut String,
    items: &[&Item],
    progress: &ProgressMap,
    summary: &ProgressSummary,
    filter: &ItemFilter,
) {
    page.push_str("<form method=\"post\" action=\"/\"><input type=\"hidden\" name=\"_action\" value=\"save\">");
    if let Some(category) = filter.category {
        let _ = write!(
            page,
            "<input type=\"hidden\" name=\"category\" value=\"{}\">",
            category.label()
        );
    }
    if let Some(name) = filter.name.as_deref() {
        let _ = write!(
            page,
            "<input type=\"hidden\" name=\"q\" value=\"{}\">",
            escape_html(name)
        );
    }
    page.push('\n');

    let mut current = None;
    for item in items {
        if current != Some(item.category) {
            if current.is_some() {
                page.push_str("</table>\n");
            }
            current = Some(item.category);
            let counts = summary
                .by_category
                .get(&item.category)
                .cloned()
                .unwrap_or_default();
            let _ = writeln!(
                page,
                "<h2>{} <small>({}/{} completed)</small></h2>\n<table><tr><th>Item</th><th>Blueprint</th><th>Completed</th></tr>",
                item.category.label(),
                counts.completed,
                counts.total
            );
        }

        let entry = progress
            .get(&item.id)
            .copied()
            .unwrap_or_default()
            .normalized();
        let id = escape_html(&item.id);
        let _ = writeln!(
            page,
            "<tr><td><input type=\"hidden\" name=\"shown\" value=\"{id}\"><a href=\"{url}\" target=\"_blank\" rel=\"noopener\">{name}</a></td>\
<td><input type=\"checkbox\" name=\"bp\" value=\"{id}\"{bp}></td>\
<td><input type=\"checkbox\" name=\"done\" value=\"{id}\"{done}></td></tr>",
            url = escape_html(&item.url),
            name = escape_html(&item.name),
            bp = checked(entry.blueprint),
            done = checked(entry.completed),
        );
    }
    page.push_str("</table>\n<button type=\"submit\">Save progress</button></form>\n");
}

fn checked(value: bool) -> &'static str {
    if value { " checked" } else { "" }
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::catalog::{item_id, normalize_name};

    fn catalog() -> Catalog {
        let item = |category: Category, name: &str| Item {
            id: item_id(category, name),
            name: name.to_string(),
            category,
            url: format!("https://warframe.fandom.com/wiki/{}", normalize_name(name)),
        };
        Catalog {
            source: None,
            items: vec![
                item(Category::Warframes, "Ember"),
                item(Category::Warframes, "Excalibur"),
                item(Category::Primary, "Paris Prime"),
                item(Category::Primary, "Soma"),
                item(Category::Melee, "Skana"),
            ],
        }
    }

    fn app() -> (TempDir, WebApp) {
        let temp = tempdir().expect("tempdir");
        let store = ProgressStore::new(&temp.path().join("data").join("progress.db"));
        (temp, WebApp::new(catalog(), store))
    }

    fn get(app: &WebApp, url: &str) -> WebResponse {
        app.handle(&WebRequest {
            method: "GET",
            url,
            body: "",
        })
    }

    fn post(app: &WebApp, body: &str) -> WebResponse {
        app.handle(&WebRequest {
            method: "POST",
            url: "/",
            body,
        })
    }

    fn all_shown(app: &WebApp) -> String {
        app.catalog()
            .items
            .iter()
            .map(|item| format!("shown={}", item.id.replace('/', "%2F")))
            .collect::<Vec<_>>()
            .join("&")
    }

    #[test]
    fn empty_store_shows_every_item_unchecked() {
        let (_temp, app) = app();
        let response = get(&app, "/");
        assert_eq!(response.status, 200);
        for item in &app.catalog().items {
            assert!(response.body.contains(&item.name), "{}", item.name);
        }
        assert!(!response.body.contains(" checked"));
        assert!(response.body.contains("0 of 5 items completed"));
    }

    #[test]
    fn saved_checkbox_survives_reload() {
        let (_temp, app) = app();
        let body = format!(
            "_action=save&{}&done=primaries%2FParis_Prime",
            all_shown(&app)
        );
        let response = post(&app, &body);
        assert_eq!(response.status, 303);
        assert_eq!(response.location.as_deref(), Some("/"));

        let page = get(&app, "/").body;
        assert!(page.contains("name=\"done\" value=\"primaries/Paris_Prime\" checked"));
        assert!(page.contains("name=\"bp\" value=\"primaries/Paris_Prime\" checked"));
        assert!(!page.contains("name=\"done\" value=\"primaries/Soma\" checked"));
        assert!(page.contains("1 of 5 items completed"));
    }

    #[test]
    fn reload_without_save_shows_stored_state_only() {
        let (_temp, app) = app();
        post(
            &app,
            &format!("_action=save&{}&bp=warframes%2FEmber", all_shown(&app)),
        );
        let first = get(&app, "/").body;
        let second = get(&app, "/?").body;
        assert_eq!(first, second);
        assert!(first.contains("name=\"bp\" value=\"warframes/Ember\" checked"));
        assert!(!first.contains("name=\"done\" value=\"warframes/Ember\" checked"));
    }

    #[test]
    fn filters_limit_rendered_items() {
        let (_temp, app) = app();
        let page = get(&app, "/?category=Primary&q=PARIS").body;
        assert!(page.contains("Paris Prime"));
        assert!(!page.contains(">Soma<"));
        assert!(!page.contains(">Ember<"));
        assert!(page.contains("<option value=\"Primary\" selected>"));

        let page = get(&app, "/?category=warframes").body;
        assert!(page.contains(">Ember<"));
        assert!(!page.contains(">Paris Prime<"));

        let page = get(&app, "/?category=Melee&q=ember").body;
        assert!(page.contains("No items match the current filters."));
        assert!(!page.contains("Save progress"));
    }

    #[test]
    fn name_search_is_not_trimmed_but_blank_is_ignored() {
        let (_temp, app) = app();
        let page = get(&app, "/?q=soma+").body;
        assert!(page.contains("No items match the current filters."));

        let page = get(&app, "/?q=+++").body;
        for item in &app.catalog().items {
            assert!(page.contains(&format!(">{}<", item.name)), "{}", item.name);
        }
    }

    #[test]
    fn filtered_save_keeps_hidden_items() {
        let (_temp, app) = app();
        post(
            &app,
            &format!("_action=save&{}&done=warframes%2FEmber", all_shown(&app)),
        );

        let response = post(
            &app,
            "_action=save&category=Primary&q=paris&shown=primaries%2FParis_Prime&bp=primaries%2FParis_Prime",
        );
        assert_eq!(response.location.as_deref(), Some("/?category=Primary&q=paris"));

        let stored = app.progress.load().expect("load");
        assert_eq!(stored.get("warframes/Ember"), Some(&ProgressEntry::OWNED));
        assert_eq!(
            stored.get("primaries/Paris_Prime"),
            Some(&ProgressEntry::new(true, false))
        );
    }

    #[test]
    fn unknown_ids_in_form_are_ignored() {
        let (_temp, app) = app();
        post(&app, "_action=save&shown=bogus%2FThing&done=bogus%2FThing");
        assert!(app.progress.load().expect("load").is_empty());
    }

    #[test]
    fn bulk_import_marks_items_and_reports_counts() {
        let (_temp, app) = app();
        let response = post(&app, "_action=bulk_import&items=Soma%0Askana%0AForma%0A");
        assert_eq!(response.status, 303);
        assert_eq!(response.location.as_deref(), Some("/?imported=2&unmatched=1"));

        let page = get(&app, "/?imported=2&unmatched=1").body;
        assert!(page.contains("Imported 2 items; 1 names were not recognised."));
        assert!(page.contains("name=\"done\" value=\"primaries/Soma\" checked"));
        assert!(page.contains("name=\"done\" value=\"melees/Skana\" checked"));
    }

    #[test]
    fn unknown_category_is_a_bad_request() {
        let (_temp, app) = app();
        let response = get(&app, "/?category=Archwing");
        assert_eq!(response.status, 400);
        assert!(response.body.contains("unknown category"));
    }

    #[test]
    fn routing_rejects_other_paths_methods_and_actions() {
        let (_temp, app) = app();
        assert_eq!(get(&app, "/favicon.ico").status, 404);
        let response = app.handle(&WebRequest {
            method: "DELETE",
            url: "/",
            body: "",
        });
        assert_eq!(response.status, 405);
        assert_eq!(post(&app, "_action=launch").status, 400);
    }

    #[test]
    fn persistence_failure_surfaces_as_error_page() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file in the way").expect("write");
        let app = WebApp::new(catalog(), ProgressStore::new(&blocker.join("progress.db")));

        let response = post(&app, "_action=save&shown=warframes%2FEmber&done=warframes%2FEmber");
        assert_eq!(response.status, 500);
        assert!(response.body.contains("failed to save progress"));
    }

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(
            escape_html("<a href=\"x\">Ack & Brunt's</a>"),
            "&lt;a href=&quot;x&quot;&gt;Ack &amp; Brunt&#39;s&lt;/a&gt;"
        );
    }
}
