use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Environment variable that overrides asset discovery.
pub const ASSETS_ENV: &str = "WAIVEFRONT_ASSETS";

/// A validated root directory containing WaiveFront runtime assets (JSON + shaders).
///
/// Front ends pass this into the engine so path resolution is the same for the viewer, the
/// plugin adapter and tests.
#[derive(Debug, Clone)]
pub struct AssetsRoot {
    path: PathBuf,
}

impl AssetsRoot {
    /// Locate the `assets/` directory.
    ///
    /// Resolution order:
    /// 1) `WAIVEFRONT_ASSETS` env var (if set and existing)
    /// 2) Search upward from `start_dir` for a folder named `assets`
    pub fn discover(start_dir: &Path) -> Result<Self, EngineError> {
        if let Ok(p) = std::env::var(ASSETS_ENV) {
            let pb = PathBuf::from(p);
            if pb.is_dir() {
                return Ok(Self { path: pb });
            }
            crate::logw!("CONFIG", "{ASSETS_ENV}={} is not a directory; searching upward", pb.display());
        }

        let mut cur = start_dir.to_path_buf();
        loop {
            let cand = cur.join("assets");
            if cand.is_dir() {
                return Ok(Self { path: cand });
            }
            if !cur.pop() {
                break;
            }
        }

        Err(EngineError::AssetsNotFound {
            start_dir: start_dir.to_path_buf(),
        })
    }

    /// Use `dir` as-is (tests, explicit `--assets`).
    pub fn at(dir: &Path) -> Result<Self, EngineError> {
        if dir.is_dir() {
            Ok(Self {
                path: dir.to_path_buf(),
            })
        } else {
            Err(EngineError::AssetsNotFound {
                start_dir: dir.to_path_buf(),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    /// Choose OS-specific JSON config if present, otherwise fall back to `<stem>.json`.
    ///
    /// Example: `params.macos.json` overrides `params.json` on macOS.
    pub fn pick_platform_json(&self, stem: &str) -> PathBuf {
        pick_platform_json(&self.path, stem)
    }

    /// Resolve a JSON-provided path against this root.
    pub fn resolve(&self, s: &str) -> PathBuf {
        resolve_assets_path(&self.path, s)
    }
}

/// Choose OS-specific JSON config if present, otherwise fall back to `<stem>.json`.
pub fn pick_platform_json(assets: &Path, stem: &str) -> PathBuf {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "other"
    };

    let platform = assets.join(format!("{stem}.{os}.json"));
    if platform.exists() {
        platform
    } else {
        assets.join(format!("{stem}.json"))
    }
}

/// Resolve a JSON-provided path relative to the assets directory unless it is already absolute.
pub fn resolve_assets_path(assets_dir: &Path, s: &str) -> PathBuf {
    let p = PathBuf::from(s);
    if p.is_absolute() {
        p
    } else {
        assets_dir.join(p)
    }
}

pub fn read_to_string_result(path: &Path) -> Result<String, EngineError> {
    std::fs::read_to_string(path).map_err(|e| EngineError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_override_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("params.json"), "{}").unwrap();
        assert_eq!(pick_platform_json(dir.path(), "params"), dir.path().join("params.json"));

        let os = if cfg!(target_os = "windows") {
            "windows"
        } else if cfg!(target_os = "macos") {
            "macos"
        } else if cfg!(target_os = "linux") {
            "linux"
        } else {
            "other"
        };
        let over = dir.path().join(format!("params.{os}.json"));
        std::fs::write(&over, "{}").unwrap();
        assert_eq!(pick_platform_json(dir.path(), "params"), over);
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let root = AssetsRoot::at(&std::env::temp_dir()).unwrap();
        assert_eq!(root.resolve("shaders/a.frag"), std::env::temp_dir().join("shaders/a.frag"));
        let abs = std::env::temp_dir().join("x.frag");
        assert_eq!(root.resolve(abs.to_str().unwrap()), abs);
    }

    #[test]
    fn missing_root_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(matches!(AssetsRoot::at(&gone), Err(EngineError::AssetsNotFound { .. })));
    }
}
