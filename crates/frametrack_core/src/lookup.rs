use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::catalog::{Catalog, Category, Item};

pub trait UrlOpener {
    fn open(&mut self, url: &str) -> Result<()>;
}

/// Opens URLs in the system's default browser.
pub struct BrowserOpener;

impl UrlOpener for BrowserOpener {
    fn open(&mut self, url: &str) -> Result<()> {
        webbrowser::open(url).with_context(|| format!("failed to open {url} in the default browser"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Opened(Item),
    Cancelled,
}

struct Prompter<'a, R, W> {
    input: &'a mut R,
    output: &'a mut W,
}

impl<R: BufRead, W: Write> Prompter<'_, R, W> {
    /// `None` on empty input or end of input.
    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{prompt}").context("failed to write prompt")?;
        self.output.flush().context("failed to flush prompt")?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read terminal input")?;
        if read == 0 {
            writeln!(self.output).context("failed to write output")?;
            return Ok(None);
        }
        let answer = line.trim();
        if answer.is_empty() {
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }

    fn say(&mut self, message: &str) -> Result<()> {
        writeln!(self.output, "{message}").context("failed to write output")
    }
}

/// Category, then starting letter, then item; opens the chosen item's wiki page.
pub fn run_lookup<R: BufRead, W: Write>(
    catalog: &Catalog,
    input: &mut R,
    output: &mut W,
    opener: &mut dyn UrlOpener,
) -> Result<LookupOutcome> {
    let mut prompter = Prompter { input, output };

    let categories = catalog.categories();
    if categories.is_empty() {
        prompter.say("No items available; run `frametrack refresh` first.")?;
        return Ok(LookupOutcome::Cancelled);
    }

    prompter.say("Categories:")?;
    for (index, category) in categories.iter().enumerate() {
        prompter.say(&format!(
            "  {}) {} ({} items)",
            index + 1,
            category.label(),
            catalog.count_in(*category)
        ))?;
    }
    let category = loop {
        let Some(answer) = prompter.ask("Select a category (number or name, empty to quit): ")?
        else {
            return Ok(LookupOutcome::Cancelled);
        };
        match choose_category(&categories, &answer) {
            Some(category) => break category,
            None => prompter.say(&format!("'{answer}' is not one of the listed categories."))?,
        }
    };

    let letters = catalog.starting_letters(category);
    prompter.say(&format!(
        "{} starting letters: {}",
        category.label(),
        letters
            .iter()
            .map(char::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    ))?;
    let letter = loop {
        let Some(answer) = prompter.ask("Select a starting letter (empty to quit): ")? else {
            return Ok(LookupOutcome::Cancelled);
        };
        match choose_letter(&letters, &answer) {
            Some(letter) => break letter,
            None => prompter.say(&format!(
                "'{answer}' is not an available starting letter for {}.",
                category.label()
            ))?,
        }
    };

    let items = catalog.items_starting_with(category, letter);
    for (index, item) in items.iter().enumerate() {
        prompter.say(&format!("  {}) {}", index + 1, item.name))?;
    }
    let item = loop {
        let Some(answer) = prompter.ask("Select an item number (empty to quit): ")? else {
            return Ok(LookupOutcome::Cancelled);
        };
        match choose_index(items.len(), &answer) {
            Some(index) => break items[index],
            None => prompter.say(&format!(
                "'{answer}' is not a number between 1 and {}.",
                items.len()
            ))?,
        }
    };

    prompter.say(&format!("Opening {}: {}", item.name, item.url))?;
    info!(id = %item.id, url = %item.url, "opening wiki page");
    opener.open(&item.url)?;
    Ok(LookupOutcome::Opened(item.clone()))
}

fn choose_category(categories: &[Category], answer: &str) -> Option<Category> {
    if let Some(index) = choose_index(categories.len(), answer) {
        return categories.get(index).copied();
    }
    Category::parse(answer)
        .ok()
        .filter(|category| categories.contains(category))
}

fn choose_letter(letters: &[char], answer: &str) -> Option<char> {
    let mut chars = answer.chars();
    let first = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    let letter = first.to_uppercase().next().unwrap_or(first);
    letters.contains(&letter).then_some(letter)
}

/// Parses a 1-based choice into a 0-based index.
fn choose_index(len: usize, answer: &str) -> Option<usize> {
    let number = answer.parse::<usize>().ok()?;
    (1..=len).contains(&number).then(|| number - 1)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::bail;

    use super::*;
    use crate::catalog::{item_id, normalize_name};

    #[derive(Default)]
    struct RecordingOpener {
        opened: Vec<String>,
        fail: bool,
    }

    impl UrlOpener for RecordingOpener {
        fn open(&mut self, url: &str) -> Result<()> {
            if self.fail {
                bail!("no browser available");
            }
            self.opened.push(url.to_string());
            Ok(())
        }
    }

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
                item(Category::Warframes, "Equinox"),
                item(Category::Warframes, "Excalibur"),
                item(Category::Warframes, "Mag"),
                item(Category::Primary, "Embolist"),
                item(Category::Primary, "Paris Prime"),
            ],
        }
    }

    fn run(input: &str, opener: &mut RecordingOpener) -> (Result<LookupOutcome>, String) {
        let catalog = catalog();
        let mut input = Cursor::new(input.as_bytes().to_vec());
        let mut output = Vec::new();
        let outcome = run_lookup(&catalog, &mut input, &mut output, opener);
        (outcome, String::from_utf8(output).expect("utf8 output"))
    }

    #[test]
    fn warframes_letter_e_lists_only_matching_frames_and_opens_first() {
        let mut opener = RecordingOpener::default();
        let (outcome, output) = run("Warframes\nE\n1\n", &mut opener);

        let outcome = outcome.expect("lookup");
        match outcome {
            LookupOutcome::Opened(item) => assert_eq!(item.name, "Ember"),
            LookupOutcome::Cancelled => panic!("lookup was cancelled"),
        }
        assert_eq!(
            opener.opened,
            vec!["https://warframe.fandom.com/wiki/Ember".to_string()]
        );
        assert!(output.contains("  1) Ember\n  2) Equinox\n  3) Excalibur\n"));
        assert!(!output.contains(") Embolist"));
        assert!(!output.contains(") Mag"));
        assert!(output.contains("Warframes starting letters: E M"));
    }

    #[test]
    fn invalid_input_reprompts_each_step() {
        let mut opener = RecordingOpener::default();
        let (outcome, output) = run("9\nArchwing\n2\nz\nEE\np\n0\nthree\n1\n", &mut opener);

        let outcome = outcome.expect("lookup");
        assert_eq!(
            outcome,
            LookupOutcome::Opened(catalog().items[5].clone())
        );
        assert!(output.contains("'9' is not one of the listed categories."));
        assert!(output.contains("'Archwing' is not one of the listed categories."));
        assert!(output.contains("'z' is not an available starting letter for Primary."));
        assert!(output.contains("'EE' is not an available starting letter"));
        assert!(output.contains("'0' is not a number between 1 and 1."));
        assert!(output.contains("'three' is not a number between 1 and 1."));
        assert_eq!(
            opener.opened,
            vec!["https://warframe.fandom.com/wiki/Paris_Prime".to_string()]
        );
    }

    #[test]
    fn empty_input_or_eof_cancels() {
        let mut opener = RecordingOpener::default();
        let (outcome, _) = run("\n", &mut opener);
        assert_eq!(outcome.expect("lookup"), LookupOutcome::Cancelled);

        let (outcome, _) = run("1\nE\n", &mut opener);
        assert_eq!(outcome.expect("lookup"), LookupOutcome::Cancelled);
        assert!(opener.opened.is_empty());
    }

    #[test]
    fn opener_failure_is_reported_after_printing_url() {
        let mut opener = RecordingOpener {
            fail: true,
            ..RecordingOpener::default()
        };
        let (outcome, output) = run("warframes\nm\n1\n", &mut opener);
        let error = outcome.expect_err("must fail");
        assert!(error.to_string().contains("no browser available"));
        assert!(output.contains("Opening Mag: https://warframe.fandom.com/wiki/Mag"));
    }

    #[test]
    fn empty_catalog_cancels_with_hint() {
        let mut opener = RecordingOpener::default();
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let outcome = run_lookup(&Catalog::default(), &mut input, &mut output, &mut opener)
            .expect("lookup");
        assert_eq!(outcome, LookupOutcome::Cancelled);
        assert!(
            String::from_utf8(output)
                .expect("utf8")
                .contains("frametrack refresh")
        );
    }
}
