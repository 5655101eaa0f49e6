//! Data models for rugbatch.

mod item;

pub use item::{
    load_items, parse_csv, render_template, Item, ItemLoadError, DEFAULT_PROMPT_TEMPLATE,
};
