//! Zip archives of generated images, grouped by date folder.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::ResultsError;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// A dated output folder containing images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDate {
    pub date: String,
    pub image_count: usize,
}

/// `YYYY-MM-DD`
pub fn is_date_folder(name: &str) -> bool {
    chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok() && name.len() == 10
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Image files in `<output>/<date>/images`, sorted by name.
pub fn image_files(output_dir: &Path, date: &str) -> Result<Vec<PathBuf>, ResultsError> {
    if !is_date_folder(date) {
        return Err(ResultsError::InvalidDate(date.to_string()));
    }
    let images_dir = output_dir.join(date).join("images");
    if !images_dir.is_dir() {
        return Err(ResultsError::NotFound(format!(
            "no images folder for {}",
            date
        )));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&images_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    files.sort();
    Ok(files)
}

/// Date folders that contain at least one image, newest first.
pub fn list_image_dates(output_dir: &Path) -> Result<Vec<ImageDate>, ResultsError> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut dates = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.path().is_dir() || !is_date_folder(&name) {
            continue;
        }
        let count = match image_files(output_dir, &name) {
            Ok(files) => files.len(),
            Err(ResultsError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        if count > 0 {
            dates.push(ImageDate {
                date: name,
                image_count: count,
            });
        }
    }

    dates.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(dates)
}

/// Zip every image of a date folder into memory (deflate).
pub fn zip_images(output_dir: &Path, date: &str) -> Result<Vec<u8>, ResultsError> {
    let files = image_files(output_dir, date)?;
    if files.is_empty() {
        return Err(ResultsError::NotFound(format!("no images for {}", date)));
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        writer.start_file(name, options)?;
        writer.write_all(&std::fs::read(path)?)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Archive file name used for downloads, e.g. `rug-images-2025-01-02.zip`.
pub fn archive_name(date: &str) -> String {
    format!("rug-images-{}.zip", date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_image(root: &Path, date: &str, name: &str) {
        let dir = root.join(date).join("images");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), b"img").unwrap();
    }

    #[test]
    fn test_list_dates_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "2025-01-02", "a.png");
        write_image(dir.path(), "2025-03-01", "b.jpg");
        write_image(dir.path(), "2025-03-01", "c.jpeg");
        std::fs::create_dir_all(dir.path().join("2025-04-01/images")).unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-date/images")).unwrap();

        let dates = list_image_dates(dir.path()).unwrap();
        assert_eq!(
            dates,
            vec![
                ImageDate {
                    date: "2025-03-01".to_string(),
                    image_count: 2
                },
                ImageDate {
                    date: "2025-01-02".to_string(),
                    image_count: 1
                },
            ]
        );
    }

    #[test]
    fn test_zip_contains_only_images() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "2025-01-02", "rug-1.png");
        write_image(dir.path(), "2025-01-02", "notes.txt");

        let bytes = zip_images(dir.path(), "2025-01-02").unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);

        let mut file = archive.by_name("rug-1.png").unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"img");
    }

    #[test]
    fn test_rejects_bad_dates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            zip_images(dir.path(), "../etc"),
            Err(ResultsError::InvalidDate(_))
        ));
        assert!(matches!(
            zip_images(dir.path(), "2025-01-02"),
            Err(ResultsError::NotFound(_))
        ));
    }
}
