//! `--manifest` archive introspection: when `-a` names an archive root,
//! describe the model configurations and image files found there as JSON
//! and exit before any write path runs.
//!
//! The archive reader that supplies image bytes is an external
//! collaborator; what this module owns is just enough directory
//! discovery to answer "what models and images does this archive root
//! contain," rendered as JSON via `serde_json` rather than a printed
//! table.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// One model directory inside the archive root: a board name plus
/// whichever recognized image files it carries.
#[derive(Debug, Serialize)]
pub struct ModelConfig {
    pub model: String,
    pub images: Vec<ImageEntry>,
}

#[derive(Debug, Serialize)]
pub struct ImageEntry {
    pub role: ImageRole,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Bios,
    Ec,
    Pd,
}

const ROLE_FILENAMES: &[(&str, ImageRole)] = &[
    ("bios.bin", ImageRole::Bios),
    ("image.bin", ImageRole::Bios),
    ("ec.bin", ImageRole::Ec),
    ("pd.bin", ImageRole::Pd),
];

/// Walk `archive_root` one level deep: every subdirectory is a model
/// configuration, named for the directory, carrying whichever recognized
/// image files it contains.
pub fn discover(archive_root: &Path) -> std::io::Result<Vec<ModelConfig>> {
    let mut models = Vec::new();
    for entry in fs::read_dir(archive_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let model = entry.file_name().to_string_lossy().into_owned();
        let images = discover_images(&entry.path())?;
        models.push(ModelConfig { model, images });
    }
    models.sort_by(|a, b| a.model.cmp(&b.model));
    Ok(models)
}

fn discover_images(model_dir: &Path) -> std::io::Result<Vec<ImageEntry>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(model_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((_, role)) = ROLE_FILENAMES.iter().find(|(fname, _)| *fname == name) {
            images.push(ImageEntry {
                role: *role,
                path: entry.path().display().to_string(),
            });
        }
    }
    Ok(images)
}

/// Render the discovered model configurations as the JSON document
/// `--manifest` prints to standard output.
pub fn render_json(models: &[ModelConfig]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(models)
}

pub fn resolve_image_path(archive_root: Option<&Path>, relative: &str) -> PathBuf {
    match archive_root {
        Some(root) => root.join(relative),
        None => PathBuf::from(relative),
    }
}
