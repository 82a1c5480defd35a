use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::assets::{read_to_string_result, AssetsRoot};
use crate::error::EngineError;
use crate::osc::OscConfig;
use crate::registry::{ControlOrigin, DataCategory, DataSources, DataTag, QualifiedTag, Value, ValueKind};
use crate::shader::{ShaderSource, UniformBindings};
use crate::validate::{self, IssueLevel, ValidationIssue};
use crate::video::VideoConfig;

/// How strictly to interpret/validate config files.
///
/// - `Lenient` is forward-compatible: unknown fields are ignored and missing optional
///   keys fall back to defaults.
/// - `Strict` is fail-fast: unknown fields, unsupported versions and validation errors
///   become errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    #[default]
    Lenient,
    Strict,
}

/// Resolved, OS-aware config paths for one run.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub assets_dir: PathBuf,
    pub render_json: PathBuf,
    pub params_json: PathBuf,
    pub video_json: PathBuf,
}

pub fn resolve_config_paths(assets: &AssetsRoot) -> ConfigPaths {
    ConfigPaths {
        assets_dir: assets.path().to_path_buf(),
        render_json: assets.pick_platform_json("render"),
        params_json: assets.pick_platform_json("params"),
        video_json: assets.pick_platform_json("video"),
    }
}

/// A JSON file loaded from disk (path + raw text + parsed `serde_json::Value`).
#[derive(Debug, Clone)]
pub struct LoadedJson {
    pub path: PathBuf,
    pub src: String,
    pub value: JsonValue,
}

/// Load any JSON file as `LoadedJson`.
pub fn load_json_file(path: &Path) -> Result<LoadedJson, EngineError> {
    let src = read_to_string_result(path)?;
    let value: JsonValue = serde_json::from_str(&src).map_err(|e| EngineError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(LoadedJson {
        path: path.to_path_buf(),
        src,
        value,
    })
}

/// Deserialize a previously-loaded JSON file into a typed struct.
pub fn parse_loaded_json<T: DeserializeOwned>(loaded: &LoadedJson) -> Result<T, EngineError> {
    serde_json::from_value::<T>(loaded.value.clone()).map_err(|e| EngineError::JsonValue {
        path: loaded.path.clone(),
        source: e,
    })
}

fn default_version() -> u32 {
    1
}

/// Shape checks shared by every config file. Strict mode also rejects unknown keys and
/// versions other than 1.
fn check_shape(
    loaded: &LoadedJson,
    kind: &str,
    known: &[&str],
    mode: ConfigMode,
) -> Result<(), EngineError> {
    let Some(obj) = loaded.value.as_object() else {
        return Err(EngineError::InvalidConfig {
            path: loaded.path.clone(),
            msg: format!("{kind} must be a JSON object"),
        });
    };
    if mode == ConfigMode::Lenient {
        return Ok(());
    }
    let unknown: Vec<&str> = obj
        .keys()
        .map(String::as_str)
        .filter(|k| *k != "version" && !known.contains(k))
        .collect();
    if !unknown.is_empty() {
        return Err(EngineError::InvalidConfig {
            path: loaded.path.clone(),
            msg: format!("unknown field(s) in {kind}: {}", unknown.join(", ")),
        });
    }
    let version = obj.get("version").and_then(JsonValue::as_u64).unwrap_or(1);
    if version != 1 {
        return Err(EngineError::InvalidConfig {
            path: loaded.path.clone(),
            msg: format!("unsupported {kind} version {version} (expected 1)"),
        });
    }
    Ok(())
}

/// Load an optional config file. A missing file is `None`; anything else that goes wrong is
/// an error.
fn load_optional(
    path: &Path,
    kind: &str,
    known: &[&str],
    mode: ConfigMode,
) -> Result<Option<LoadedJson>, EngineError> {
    if !path.exists() {
        crate::logi!("CONFIG", "{kind} not found at {}; using defaults", path.display());
        return Ok(None);
    }
    let loaded = load_json_file(path)?;
    check_shape(&loaded, kind, known, mode)?;
    crate::logi!("CONFIG", "loaded {}", path.display());
    Ok(Some(loaded))
}

// ---------------------------------------------------------------------------------------------
// render.json

/// Typed view of `assets/render.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderJson {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Vertex stage path; the built-in pass-through stage when omitted.
    pub vertex: Option<String>,
    pub fragment: Option<String>,
    /// uniform name -> qualified tag
    pub bindings: BTreeMap<String, String>,
    /// uniform name -> fixed value
    pub constants: BTreeMap<String, JsonValue>,
    pub clear_color: [f32; 4],
}

impl Default for RenderJson {
    fn default() -> Self {
        Self {
            version: 1,
            vertex: None,
            fragment: None,
            bindings: BTreeMap::new(),
            constants: BTreeMap::new(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

const RENDER_KEYS: &[&str] = &["vertex", "fragment", "bindings", "constants", "clear_color"];

/// `render.json` with every path resolved against the assets directory.
#[derive(Debug, Clone)]
pub struct RenderSelection {
    pub vertex_path: Option<PathBuf>,
    pub fragment_path: PathBuf,
    pub bindings: UniformBindings,
    pub clear_color: [f32; 4],
}

impl RenderSelection {
    fn from_json(assets: &AssetsRoot, rj: RenderJson) -> Self {
        Self {
            vertex_path: rj.vertex.as_deref().map(|s| assets.resolve(s)),
            fragment_path: rj
                .fragment
                .as_deref()
                .map(|s| assets.resolve(s))
                .unwrap_or_else(|| assets.join("shaders").join("default.frag")),
            bindings: UniformBindings {
                explicit: rj.bindings,
                constants: rj.constants,
            },
            clear_color: rj.clear_color,
        }
    }

    pub fn shader_source(&self) -> Result<ShaderSource, EngineError> {
        match &self.vertex_path {
            Some(v) => ShaderSource::from_files(v, &self.fragment_path),
            None => ShaderSource::with_default_vertex(&self.fragment_path),
        }
    }
}

pub fn load_render_selection(assets: &AssetsRoot, mode: ConfigMode) -> Result<RenderSelection, EngineError> {
    let path = assets.pick_platform_json("render");
    let rj = match load_optional(&path, "render.json", RENDER_KEYS, mode)? {
        Some(loaded) => parse_loaded_json::<RenderJson>(&loaded)?,
        None => RenderJson::default(),
    };
    Ok(RenderSelection::from_json(assets, rj))
}

// ---------------------------------------------------------------------------------------------
// params.json

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryJson {
    pub name: String,
    #[serde(default)]
    pub presentation_name: Option<String>,
    #[serde(default)]
    pub order: i32,
}

/// One tag declaration. `type` stays a string here so one bad entry does not reject the file;
/// the validation pass reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct TagJson {
    pub category: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub smoothing: f32,
    #[serde(default)]
    pub control: ControlOrigin,
}

/// Typed view of `assets/params(.<os>).json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParamsJson {
    #[serde(default = "default_version")]
    pub version: u32,
    pub categories: Vec<CategoryJson>,
    pub tags: Vec<TagJson>,
    pub osc: OscConfig,
}

const PARAMS_KEYS: &[&str] = &["categories", "tags", "osc"];

impl ParamsJson {
    /// Declare every category and tag into `registry`.
    ///
    /// Entries that cannot be declared are logged and skipped. Returns the declared
    /// defaults, ready to be written by the defaults source.
    pub fn declare(&self, registry: &DataSources) -> Vec<(QualifiedTag, Value)> {
        for c in &self.categories {
            let cat = DataCategory {
                name: c.name.clone(),
                presentation_name: c.presentation_name.clone().unwrap_or_else(|| c.name.clone()),
                order: c.order,
            };
            if let Err(e) = registry.declare_category(cat) {
                crate::logw!("CONFIG", "category '{}' skipped: {e}", c.name);
            }
        }

        let mut defaults = Vec::new();
        for t in &self.tags {
            let Some(kind) = ValueKind::parse(&t.kind) else {
                crate::logw!("CONFIG", "tag '{}/{}' skipped: unknown type '{}'", t.category, t.name, t.kind);
                continue;
            };
            let qualified = match QualifiedTag::new(&t.category, &t.name) {
                Ok(q) => q,
                Err(e) => {
                    crate::logw!("CONFIG", "tag '{}/{}' skipped: {e}", t.category, t.name);
                    continue;
                }
            };
            let mut tag = DataTag::new(qualified.clone(), kind)
                .with_smoothing(t.smoothing)
                .with_control(t.control);
            if let Some(raw) = &t.default {
                match Value::from_json(kind, raw) {
                    Some(v) => tag = tag.with_default(v),
                    None => crate::logw!("CONFIG", "tag '{qualified}': default {raw} is not a {kind}"),
                }
            }
            let default = tag.default.clone();
            match registry.declare_tag(tag) {
                Ok(q) => {
                    if let Some(v) = default {
                        defaults.push((q, v));
                    }
                }
                Err(e) => crate::logw!("CONFIG", "tag '{qualified}' skipped: {e}"),
            }
        }
        defaults
    }
}

// ---------------------------------------------------------------------------------------------
// video.json

const VIDEO_KEYS: &[&str] = &["path", "loop", "pacing", "failure_threshold", "ffmpeg", "ffprobe"];

/// `video.json` with its path resolved.
#[derive(Debug, Clone, Default)]
pub struct VideoSelection {
    pub config: VideoConfig,
    pub path: Option<PathBuf>,
}

pub fn load_video_selection(assets: &AssetsRoot, mode: ConfigMode) -> Result<VideoSelection, EngineError> {
    let path = assets.pick_platform_json("video");
    let config = match load_optional(&path, "video.json", VIDEO_KEYS, mode)? {
        Some(loaded) => parse_loaded_json::<VideoConfig>(&loaded)?,
        None => VideoConfig::default(),
    };
    Ok(VideoSelection {
        path: config.path.as_deref().map(|s| assets.resolve(s)),
        config,
    })
}

// ---------------------------------------------------------------------------------------------

/// Everything a front end needs to build an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub assets: AssetsRoot,
    pub paths: ConfigPaths,
    pub render: RenderSelection,
    pub params: ParamsJson,
    pub video: VideoSelection,
    pub issues: Vec<ValidationIssue>,
}

/// Discover `assets/` from `start_dir` and load every config file.
pub fn load_engine_config_from(start_dir: &Path, mode: ConfigMode) -> Result<EngineConfig, EngineError> {
    let assets = AssetsRoot::discover(start_dir)?;
    load_engine_config(&assets, mode)
}

pub fn load_engine_config(assets: &AssetsRoot, mode: ConfigMode) -> Result<EngineConfig, EngineError> {
    let paths = resolve_config_paths(assets);
    crate::logi!("CONFIG", "assets: {}", paths.assets_dir.display());

    let render = load_render_selection(assets, mode)?;

    let raw_params = load_optional(&paths.params_json, "params.json", PARAMS_KEYS, mode)?;
    let params = match &raw_params {
        Some(loaded) => parse_loaded_json::<ParamsJson>(loaded)?,
        None => ParamsJson::default(),
    };
    let video = load_video_selection(assets, mode)?;

    let mut issues = Vec::new();
    if let Some(loaded) = &raw_params {
        issues.extend(validate::validate_params_json(&loaded.value));
        issues.extend(validate::validate_bindings(&render.bindings, &loaded.value, params.osc.auto_declare));
        validate::emit_issues("CONFIG", &issues);
        validate::emit_summary("CONFIG", "params.json", &issues);

        if mode == ConfigMode::Strict {
            let errors: Vec<&ValidationIssue> =
                issues.iter().filter(|i| i.level == IssueLevel::Error).collect();
            if let Some(first) = errors.first() {
                return Err(EngineError::InvalidConfig {
                    path: loaded.path.clone(),
                    msg: format!("{} validation error(s); first: {}: {}", errors.len(), first.path, first.message),
                });
            }
        }
    }

    Ok(EngineConfig {
        assets: assets.clone(),
        paths,
        render,
        params,
        video,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Pacing;

    fn assets_with(files: &[(&str, &str)]) -> (tempfile::TempDir, AssetsRoot) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let root = AssetsRoot::at(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let (_dir, assets) = assets_with(&[]);
        let cfg = load_engine_config(&assets, ConfigMode::Lenient).unwrap();
        assert_eq!(cfg.render.fragment_path, assets.join("shaders").join("default.frag"));
        assert!(cfg.render.vertex_path.is_none());
        assert!(cfg.params.tags.is_empty());
        assert!(cfg.params.osc.enabled);
        assert!(cfg.video.path.is_none());
        assert!(cfg.issues.is_empty());
    }

    #[test]
    fn render_json_is_resolved() {
        let (_dir, assets) = assets_with(&[(
            "render.json",
            r#"{ "fragment": "shaders/glow.frag",
                 "bindings": { "brightness": "synth/level" },
                 "constants": { "u_gain": 2.0 },
                 "clear_color": [0.1, 0.2, 0.3, 1.0] }"#,
        )]);
        let sel = load_render_selection(&assets, ConfigMode::Lenient).unwrap();
        assert_eq!(sel.fragment_path, assets.join("shaders/glow.frag"));
        assert_eq!(sel.bindings.explicit.get("brightness").map(String::as_str), Some("synth/level"));
        assert_eq!(sel.clear_color, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn strict_mode_rejects_unknown_fields_and_versions() {
        let (_dir, assets) = assets_with(&[("render.json", r#"{ "fragmnet": "x.frag" }"#)]);
        assert!(load_render_selection(&assets, ConfigMode::Lenient).is_ok());
        assert!(matches!(
            load_render_selection(&assets, ConfigMode::Strict),
            Err(EngineError::InvalidConfig { .. })
        ));

        let (_dir, assets) = assets_with(&[("video.json", r#"{ "version": 2 }"#)]);
        assert!(matches!(
            load_video_selection(&assets, ConfigMode::Strict),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn video_json_parses_pacing_and_path() {
        let (_dir, assets) = assets_with(&[(
            "video.json",
            r#"{ "path": "media/loop.mp4", "loop": false, "pacing": "stepped", "failure_threshold": 3 }"#,
        )]);
        let sel = load_video_selection(&assets, ConfigMode::Strict).unwrap();
        assert_eq!(sel.path, Some(assets.join("media/loop.mp4")));
        assert!(!sel.config.loop_playback);
        assert_eq!(sel.config.pacing, Pacing::Stepped);
        assert_eq!(sel.config.failure_threshold, 3);
    }

    #[test]
    fn params_declare_into_registry() {
        let (_dir, assets) = assets_with(&[(
            "params.json",
            r#"{
                "categories": [ { "name": "synth", "presentation_name": "Synth", "order": 2 } ],
                "tags": [
                    { "category": "synth", "name": "level", "type": "float", "default": 0.25, "smoothing": 0.5 },
                    { "category": "synth", "name": "mode", "type": "int" },
                    { "category": "synth", "name": "bad", "type": "quaternion" }
                ],
                "osc": { "bind": "127.0.0.1:9100", "categories": ["synth"] }
            }"#,
        )]);
        let cfg = load_engine_config(&assets, ConfigMode::Lenient).unwrap();
        assert_eq!(cfg.params.osc.bind, "127.0.0.1:9100");
        assert!(cfg.issues.iter().any(|i| i.level == IssueLevel::Error));

        let reg = DataSources::new();
        let defaults = cfg.params.declare(&reg);
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].1, Value::Float(0.25));
        assert_eq!(reg.tag("synth/level").map(|t| t.smoothing), Some(0.5));
        assert!(reg.tag("synth/mode").is_some());
        assert!(reg.tag("synth/bad").is_none());
        assert_eq!(reg.snapshot().category("synth").map(|c| c.order), Some(2));

        assert!(matches!(
            load_engine_config(&assets, ConfigMode::Strict),
            Err(EngineError::InvalidConfig { .. })
        ));
    }
}
