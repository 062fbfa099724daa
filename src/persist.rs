//! Artifact directories: JSON files written atomically plus a manifest.

use crate::errors::{OccuError, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DESIGN_INFO_ENV_FILE: &str = "design_info_env.json";
pub const DESIGN_INFO_OBS_FILE: &str = "design_info_obs.json";
pub const DESIGN_INFO_FILE: &str = "design_info.json";
pub const DRAWS_FILE: &str = "draws.json";
pub const MCMC_SAMPLES_FILE: &str = "mcmc_samples.json";

const ARTIFACT_FILES: [&str; 6] = [
    MANIFEST_FILE,
    DESIGN_INFO_ENV_FILE,
    DESIGN_INFO_OBS_FILE,
    DESIGN_INFO_FILE,
    DRAWS_FILE,
    MCMC_SAMPLES_FILE,
];

/// Per-species result file of a point-estimate fit.
pub fn results_file(index: usize) -> String {
    format!("results_file_{index}.json")
}

/// Inverse of [`results_file`].
pub fn results_file_index(name: &str) -> Option<usize> {
    name.strip_prefix("results_file_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Which model wrote an artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    PointEstimate,
    MeanFieldVariational,
    FullMcmc,
    PresenceAbsence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: ModelKind,
    pub n_species: usize,
    pub crate_version: String,
}

impl Manifest {
    pub fn new(kind: ModelKind, n_species: usize) -> Self {
        Self {
            kind,
            n_species,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Serialize `value` to `path` via a temporary sibling and a rename, so a
/// crash never leaves a half-written file under the final name.
pub fn save_json_safely<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let io_err = |source| OccuError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| OccuError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    let mut file = fs::File::create(tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(tmp, path).map_err(io_err)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            OccuError::restore(path, "missing file")
        } else {
            OccuError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|source| OccuError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Create `dir` (and parents) and remove any artifact files a previous save
/// left there. Paired with [`finish_dir`], an interrupted save leaves no
/// manifest and therefore nothing that restores.
pub fn prepare_dir(dir: &Path) -> Result<()> {
    let io_err = |source| OccuError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if ARTIFACT_FILES.contains(&name) || results_file_index(name).is_some() {
            fs::remove_file(entry.path()).map_err(|source| OccuError::Io {
                path: entry.path(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Write the manifest once every other file of the artifact is in place.
pub fn finish_dir(dir: &Path, kind: ModelKind, n_species: usize) -> Result<()> {
    save_json_safely(&Manifest::new(kind, n_species), &dir.join(MANIFEST_FILE))
}

/// Read the manifest and check it was written by a `kind` model.
pub fn expect_kind(dir: &Path, kind: ModelKind) -> Result<Manifest> {
    let manifest = read_manifest(dir)?;
    if manifest.kind != kind {
        return Err(OccuError::restore(
            dir,
            format!("artifact holds a {:?} model, expected {kind:?}", manifest.kind),
        ));
    }
    Ok(manifest)
}

pub fn read_manifest(dir: &Path) -> Result<Manifest> {
    load_json(&dir.join(MANIFEST_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");
        let values = vec![0.1 + 0.2, 1.0 / 3.0, -2.5e-300, f64::MAX];
        save_json_safely(&values, &path).unwrap();
        let back: Vec<f64> = load_json(&path).unwrap();
        assert_eq!(back, values);
        assert!(!dir.path().join("values.json.tmp").exists());
    }

    #[test]
    fn manifest_kind_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        prepare_dir(dir.path()).unwrap();
        finish_dir(dir.path(), ModelKind::FullMcmc, 2).unwrap();
        assert_eq!(read_manifest(dir.path()).unwrap().n_species, 2);
        assert!(expect_kind(dir.path(), ModelKind::FullMcmc).is_ok());
        let err = expect_kind(dir.path(), ModelKind::PointEstimate).unwrap_err();
        assert!(matches!(err, OccuError::Restore { .. }));
    }

    #[test]
    fn preparing_a_directory_clears_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [MANIFEST_FILE, DRAWS_FILE, "results_file_0.json", "results_file_7.json"] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        prepare_dir(dir.path()).unwrap();

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, ["notes.txt"]);
        assert!(matches!(read_manifest(dir.path()), Err(OccuError::Restore { .. })));
    }

    #[test]
    fn results_file_names_parse_back() {
        assert_eq!(results_file_index(&results_file(12)), Some(12));
        assert_eq!(results_file_index("results_file_x.json"), None);
        assert_eq!(results_file_index(DRAWS_FILE), None);
    }

    #[test]
    fn missing_file_is_a_restore_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, OccuError::Restore { .. }));
    }
}
