//! Catalog item model and loaders.
//!
//! An `Item` is one catalog row that becomes one batch request. Loading is
//! deliberately generic: key and image columns are looked up by a few common
//! header names, and the prompt comes from a `prompt` column or a
//! `{Column}` placeholder template.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Template used when the input has no `prompt` column.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Photo-realistic interior scene featuring the rug \"{Title}\". {Description}";

const KEY_COLUMNS: &[&str] = &["SKU", "sku", "Sku", "key"];
const IMAGE_COLUMNS: &[&str] = &["image link", "image_link", "image_url", "Image URL"];
const PROMPT_COLUMNS: &[&str] = &["prompt", "Prompt"];

#[derive(Debug, Error)]
pub enum ItemLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Input contains no items")]
    Empty,
}

/// One record to be processed. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier (SKU), used to name the batch request and output image.
    pub key: String,
    /// Source product image to embed in the request, if any.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Prompt text sent with the request.
    pub prompt: String,
    /// Remaining raw columns from the input row.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Item {
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            image_url: None,
            prompt: prompt.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Key used for the batch request line, e.g. `rug-26171`.
    pub fn request_key(&self) -> String {
        format!("rug-{}", self.key)
    }

    /// Build an item from a header→value row.
    ///
    /// `row_index` is used for the fallback key `idx-<n>` when the row has
    /// no SKU.
    pub fn from_row(row: BTreeMap<String, String>, row_index: usize, template: &str) -> Self {
        let key = first_non_empty(&row, KEY_COLUMNS).unwrap_or_else(|| format!("idx-{}", row_index));
        let image_url = first_non_empty(&row, IMAGE_COLUMNS);
        let prompt = first_non_empty(&row, PROMPT_COLUMNS)
            .unwrap_or_else(|| render_template(template, &row));

        Self {
            key,
            image_url,
            prompt,
            fields: row,
        }
    }
}

fn first_non_empty(row: &BTreeMap<String, String>, columns: &[&str]) -> Option<String> {
    columns
        .iter()
        .filter_map(|c| row.get(*c))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Substitute `{Column}` placeholders with row values. Unknown columns
/// render as empty strings.
pub fn render_template(template: &str, row: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = row.get(name) {
                    out.push_str(value.trim());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse CSV text (with header row) into items.
pub fn parse_csv<R: Read>(reader: R, template: &str) -> Result<Vec<Item>, ItemLoadError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let mut items = Vec::new();

    for (index, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row: BTreeMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        if row.values().all(|v| v.trim().is_empty()) {
            continue;
        }
        items.push(Item::from_row(row, index, template));
    }

    if items.is_empty() {
        return Err(ItemLoadError::Empty);
    }
    Ok(items)
}

/// Load items from a `.csv` file or a `.json` array of items.
pub fn load_items(path: &Path, template: &str) -> Result<Vec<Item>, ItemLoadError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let items = if is_json {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str::<Vec<Item>>(&contents)?
    } else {
        let file = std::fs::File::open(path)?;
        parse_csv(file, template)?
    };

    if items.is_empty() {
        return Err(ItemLoadError::Empty);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_picks_known_columns() {
        let csv = "SKU,Title,Description,image link\n\
                   26171,Heriz Red,Hand-knotted wool,https://cdn.example.com/26171.jpg\n";
        let items = parse_csv(csv.as_bytes(), DEFAULT_PROMPT_TEMPLATE).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "26171");
        assert_eq!(
            items[0].image_url.as_deref(),
            Some("https://cdn.example.com/26171.jpg")
        );
        assert!(items[0].prompt.contains("Heriz Red"));
        assert_eq!(items[0].request_key(), "rug-26171");
    }

    #[test]
    fn test_missing_sku_falls_back_to_row_index() {
        let csv = "SKU,prompt\n,first\n,second\n";
        let items = parse_csv(csv.as_bytes(), DEFAULT_PROMPT_TEMPLATE).unwrap();

        assert_eq!(items[0].key, "idx-0");
        assert_eq!(items[1].key, "idx-1");
        assert_eq!(items[1].prompt, "second");
    }

    #[test]
    fn test_blank_rows_are_skipped_and_empty_input_rejected() {
        let csv = "SKU,prompt\n,\n";
        let err = parse_csv(csv.as_bytes(), DEFAULT_PROMPT_TEMPLATE).unwrap_err();
        assert!(matches!(err, ItemLoadError::Empty));
    }

    #[test]
    fn test_render_template() {
        let mut row = BTreeMap::new();
        row.insert("Title".to_string(), " Kazak ".to_string());
        row.insert("Origin".to_string(), "Pakistan".to_string());

        assert_eq!(
            render_template("{Title} from {Origin}, {Missing} rug", &row),
            "Kazak from Pakistan, rug"
        );
        assert_eq!(render_template("unterminated {Title", &row), "unterminated {Title");
    }

    #[test]
    fn test_load_items_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, r#"[{"key":"a","prompt":"p"}]"#).unwrap();

        let items = load_items(&path, DEFAULT_PROMPT_TEMPLATE).unwrap();
        assert_eq!(items, vec![Item::new("a", "p")]);
    }
}
