//! Result persistence, image extraction and archiving.

mod archive;
mod extract;

pub use archive::{archive_name, image_files, is_date_folder, list_image_dates, zip_images, ImageDate};
pub use extract::{
    extract_images, sanitize_file_stem, ExtractedImage, Extraction, ResultStore, SavedResults,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Invalid date folder: {0}")]
    InvalidDate(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
