use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no {noun} found for '{input}'")]
    NotFound { noun: String, input: String },
    #[error("'{input}' matches more than one {noun}; type more of the id")]
    Ambiguous { noun: String, input: String },
    #[error("picker `{binary}` not found on PATH; install it or pass an exact id")]
    PickerMissing { binary: String },
    #[error("picker failed: {0}")]
    Picker(String),
    #[error("{0}")]
    Source(String),
}

/// One kind of thing a command can target (missions, repositories, templates).
pub trait ResolverSource {
    type Item;

    fn noun(&self) -> &str;

    /// `None` when the input does not look like a direct reference. `Some(Err)`
    /// when it does but names nothing; that never falls through to search.
    fn try_canonical(&self, input: &str) -> Option<Result<Self::Item, ResolveError>>;

    fn list_items(&self) -> Result<Vec<Self::Item>, ResolveError>;

    fn search_text(&self, item: &Self::Item) -> String;

    /// Columns for the picker; aligned by the engine.
    fn format_row(&self, item: &Self::Item) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickRequest<'a> {
    pub rows: &'a [String],
    pub prompt: &'a str,
    pub query: Option<&'a str>,
    pub multi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    Selected(Vec<usize>),
    Cancelled,
}

pub trait Picker {
    fn pick(&self, request: &PickRequest<'_>) -> Result<PickOutcome, ResolveError>;
}

/// `Cancelled`: the user backed out. `Empty`: there was nothing to choose from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Selected(Vec<T>),
    Cancelled,
    Empty,
}

impl<T> Resolution<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Resolution::Selected(items) => items,
            Resolution::Cancelled | Resolution::Empty => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions<'a> {
    pub prompt: &'a str,
    pub multi: bool,
}

pub fn resolve<S, P>(
    source: &S,
    picker: &P,
    input: &str,
    options: ResolveOptions<'_>,
) -> Result<Resolution<S::Item>, ResolveError>
where
    S: ResolverSource,
    P: Picker + ?Sized,
{
    let input = input.trim();
    if input.is_empty() {
        let items = source.list_items()?;
        return pick_from(source, picker, items, None, options);
    }

    if let Some(found) = source.try_canonical(input) {
        return found.map(|item| Resolution::Selected(vec![item]));
    }

    let terms = input.split_whitespace().collect::<Vec<_>>();
    let mut items = source.list_items()?;
    let matching = items
        .iter()
        .enumerate()
        .filter(|(_, item)| sequential_match(&source.search_text(item), &terms))
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();

    debug!(
        event = "resolve_search",
        noun = source.noun(),
        input,
        candidates = items.len(),
        matches = matching.len()
    );

    if let [only] = matching.as_slice() {
        let item = items.swap_remove(*only);
        return Ok(Resolution::Selected(vec![item]));
    }

    pick_from(source, picker, items, Some(input), options)
}

fn pick_from<S, P>(
    source: &S,
    picker: &P,
    items: Vec<S::Item>,
    query: Option<&str>,
    options: ResolveOptions<'_>,
) -> Result<Resolution<S::Item>, ResolveError>
where
    S: ResolverSource,
    P: Picker + ?Sized,
{
    if items.is_empty() {
        return Ok(Resolution::Empty);
    }

    let rows = format_table(items.iter().map(|item| source.format_row(item)).collect());
    let request = PickRequest {
        rows: &rows,
        prompt: options.prompt,
        query,
        multi: options.multi,
    };
    let indices = match picker.pick(&request)? {
        PickOutcome::Cancelled => return Ok(Resolution::Cancelled),
        PickOutcome::Selected(indices) => indices,
    };

    let mut slots = items.into_iter().map(Some).collect::<Vec<_>>();
    let mut selected = Vec::new();
    for idx in indices {
        if let Some(item) = slots.get_mut(idx).and_then(Option::take) {
            selected.push(item);
        }
        if !options.multi && !selected.is_empty() {
            break;
        }
    }
    if selected.is_empty() {
        return Ok(Resolution::Cancelled);
    }
    Ok(Resolution::Selected(selected))
}

/// Every term must appear, in order and without overlap, in the lowercased text.
pub fn sequential_match(text: &str, terms: &[&str]) -> bool {
    let haystack = text.to_lowercase();
    let mut cursor = 0;
    for term in terms {
        let needle = term.to_lowercase();
        match haystack[cursor..].find(&needle) {
            Some(offset) => cursor += offset + needle.len(),
            None => return false,
        }
    }
    true
}

pub fn format_table(rows: Vec<Vec<String>>) -> Vec<String> {
    let mut widths: Vec<usize> = Vec::new();
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            match widths.get_mut(idx) {
                Some(width) => *width = (*width).max(len),
                None => widths.push(len),
            }
        }
    }
    rows.into_iter()
        .map(|row| {
            let last = row.len().saturating_sub(1);
            row.into_iter()
                .enumerate()
                .map(|(idx, cell)| {
                    if idx == last {
                        cell
                    } else {
                        let pad = widths[idx] - cell.chars().count();
                        format!("{cell}{}", " ".repeat(pad))
                    }
                })
                .collect::<Vec<_>>()
                .join("  ")
        })
        .collect()
}
