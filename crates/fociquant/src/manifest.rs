//! Manifest loading.
//!
//! A manifest is a JSON [`Manifest`]. Relative paths inside it are
//! resolved against the directory holding the manifest file, so a
//! manifest can travel with its images.

use std::path::Path;

use fociquant_pipeline::Manifest;
use log::info;

use crate::error::CliError;

/// Read, parse, resolve, and validate the manifest at `path`.
///
/// # Errors
///
/// Returns [`CliError::ManifestRead`] / [`CliError::ManifestParse`] for
/// an unreadable or malformed file and [`CliError::Pipeline`] when a
/// group id is empty or repeated. A manifest with no groups is valid.
pub fn load_manifest(path: &Path) -> Result<Manifest, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::ManifestRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mut manifest = parse_manifest(&text).map_err(|source| CliError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(base) = path.parent() {
        resolve_paths(&mut manifest, base);
    }
    manifest.validate()?;
    info!(
        "loaded manifest {} ({} image groups)",
        path.display(),
        manifest.groups.len()
    );
    Ok(manifest)
}

/// Parse manifest JSON without touching the filesystem.
///
/// # Errors
///
/// Returns the `serde_json` error for malformed input.
pub fn parse_manifest(text: &str) -> Result<Manifest, serde_json::Error> {
    serde_json::from_str(text)
}

/// Make every relative path in `manifest` relative to `base`.
pub fn resolve_paths(manifest: &mut Manifest, base: &Path) {
    for group in &mut manifest.groups {
        if group.nucleus.is_relative() {
            group.nucleus = base.join(&group.nucleus);
        }
        for path in group.foci.values_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(metadata) = group.metadata.as_mut()
            && metadata.is_relative()
        {
            *metadata = base.join(&*metadata);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const MANIFEST: &str = r#"{
        "groups": [
            {
                "id": "image_1",
                "nucleus": "masks/image_1_nuclei.tif",
                "foci": {
                    "Foci_1": "foci/image_1_foci_1.tif",
                    "Foci_2": "/data/image_1_foci_2.tif"
                },
                "metadata": "image_metadata.txt"
            }
        ]
    }"#;

    #[test]
    fn parses_groups() {
        let manifest = parse_manifest(MANIFEST).unwrap();
        assert_eq!(manifest.groups.len(), 1);
        let group = &manifest.groups[0];
        assert_eq!(group.id, "image_1");
        assert_eq!(group.foci.len(), 2);
        assert!(group.calibration.is_none());
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let mut manifest = parse_manifest(MANIFEST).unwrap();
        resolve_paths(&mut manifest, Path::new("/runs/exp1"));
        let group = &manifest.groups[0];
        assert_eq!(
            group.nucleus,
            PathBuf::from("/runs/exp1/masks/image_1_nuclei.tif")
        );
        assert_eq!(
            group.foci["Foci_1"],
            PathBuf::from("/runs/exp1/foci/image_1_foci_1.tif")
        );
        assert_eq!(group.foci["Foci_2"], PathBuf::from("/data/image_1_foci_2.tif"));
        assert_eq!(
            group.metadata.as_deref(),
            Some(Path::new("/runs/exp1/image_metadata.txt"))
        );
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        assert!(parse_manifest(r#"{"groups": [{"id": 3}]}"#).is_err());
    }
}
