use std::collections::{BTreeMap, HashMap};

use super::gpu::{ActiveUniform, GpuBackend, UniformKind, UniformLocation, UniformValue};
use crate::registry::{QualifiedTag, RegistrySnapshot, Value, ValueKind};
use crate::video::{Palette, PALETTE_SIZE};

/// Uniform-side configuration from `render.json`.
#[derive(Debug, Clone, Default)]
pub struct UniformBindings {
    /// uniform name -> qualified tag
    pub explicit: BTreeMap<String, String>,
    /// uniform name -> fixed value
    pub constants: BTreeMap<String, serde_json::Value>,
}

/// Values the engine provides without a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Time,
    Resolution,
    VideoResolution,
    Texture,
    FrameIndex,
    Palette(usize),
}

impl Builtin {
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            "u_time" => Some(Builtin::Time),
            "u_resolution" => Some(Builtin::Resolution),
            "u_video_resolution" => Some(Builtin::VideoResolution),
            "u_texture" => Some(Builtin::Texture),
            "u_frame_index" => Some(Builtin::FrameIndex),
            _ => {
                let idx: usize = name.strip_prefix("u_palette")?.parse().ok()?;
                (idx < PALETTE_SIZE).then_some(Builtin::Palette(idx))
            }
        }
    }
}

/// What feeds a uniform.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformSource {
    Tag { tag: QualifiedTag, smoothing: f32 },
    Constant(UniformValue),
    Builtin(Builtin),
    Unbound,
}

/// Per-tick inputs for built-in uniforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameContext {
    pub time: f32,
    pub width: u32,
    pub height: u32,
    pub frame_index: u64,
    pub video_size: Option<(u32, u32)>,
    pub palette: Option<Palette>,
    pub texture_unit: u32,
}

/// Exponential smoothing step factor: 1 (exact) at 0, approaching 0 as `s` approaches 1.
pub fn smoothing_alpha(s: f32) -> f32 {
    if s <= 0.0 {
        1.0
    } else {
        (1.0 - s).clamp(0.001, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderUniform {
    pub name: String,
    pub location: UniformLocation,
    pub kind: UniformKind,
    pub source: UniformSource,
    /// Last value sent to the GPU.
    pub last: Option<UniformValue>,
    smoothed: Option<f32>,
}

impl ShaderUniform {
    fn new(active: ActiveUniform, source: UniformSource) -> Self {
        Self {
            name: active.name,
            location: active.location,
            kind: active.kind,
            source,
            last: None,
            smoothed: None,
        }
    }

    fn tag_value(&mut self, v: &Value, smoothing: f32) -> Option<UniformValue> {
        match self.kind {
            UniformKind::Float => {
                let target = match v {
                    Value::Float(f) => *f,
                    Value::Int(i) => *i as f32,
                    Value::Bool(b) => f32::from(u8::from(*b)),
                    Value::String(_) => return None,
                };
                let cur = self.smoothed.unwrap_or(target);
                let mut next = cur + (target - cur) * smoothing_alpha(smoothing);
                if (target - next).abs() < 1e-6 {
                    next = target;
                }
                self.smoothed = Some(next);
                Some(UniformValue::Float(next))
            }
            UniformKind::Int | UniformKind::Bool => match v {
                Value::Int(i) => Some(UniformValue::Int(*i)),
                Value::Bool(b) => Some(UniformValue::Int(i32::from(*b))),
                Value::Float(f) => Some(UniformValue::Int(f.round() as i32)),
                Value::String(_) => None,
            },
            _ => None,
        }
    }
}

fn builtin_value(b: Builtin, kind: UniformKind, ctx: &FrameContext) -> Option<UniformValue> {
    let size2 = |(w, h): (u32, u32)| match kind {
        UniformKind::Vec2 => Some(UniformValue::Vec2([w as f32, h as f32])),
        UniformKind::Vec3 => Some(UniformValue::Vec3([w as f32, h as f32, 1.0])),
        _ => None,
    };
    match b {
        Builtin::Time => match kind {
            UniformKind::Float => Some(UniformValue::Float(ctx.time)),
            _ => None,
        },
        Builtin::Resolution => size2((ctx.width, ctx.height)),
        Builtin::VideoResolution => size2(ctx.video_size.unwrap_or((0, 0))),
        Builtin::Texture => match kind {
            UniformKind::Sampler2D => Some(UniformValue::Texture(ctx.texture_unit)),
            UniformKind::Int => Some(UniformValue::Int(ctx.texture_unit as i32)),
            _ => None,
        },
        Builtin::FrameIndex => match kind {
            UniformKind::Int => Some(UniformValue::Int(ctx.frame_index as i32)),
            UniformKind::Float => Some(UniformValue::Float(ctx.frame_index as f32)),
            _ => None,
        },
        Builtin::Palette(i) => {
            let c = ctx.palette.map(|p| p.colors[i]).unwrap_or([0.0; 3]);
            match kind {
                UniformKind::Vec3 => Some(UniformValue::Vec3(c)),
                UniformKind::Vec4 => Some(UniformValue::Vec4([c[0], c[1], c[2], 1.0])),
                _ => None,
            }
        }
    }
}

/// JSON constant -> uniform value of the declared kind.
fn constant_value(kind: UniformKind, v: &serde_json::Value) -> Option<UniformValue> {
    let floats = || -> Option<Vec<f32>> {
        v.as_array()?
            .iter()
            .map(|x| x.as_f64().map(|f| f as f32))
            .collect()
    };
    match kind {
        UniformKind::Float => v.as_f64().map(|f| UniformValue::Float(f as f32)),
        UniformKind::Int | UniformKind::Bool => v
            .as_i64()
            .map(|i| i as i32)
            .or_else(|| v.as_bool().map(i32::from))
            .map(UniformValue::Int),
        UniformKind::Vec2 => floats()?.try_into().ok().map(UniformValue::Vec2),
        UniformKind::Vec3 => floats()?.try_into().ok().map(UniformValue::Vec3),
        UniformKind::Vec4 => floats()?.try_into().ok().map(UniformValue::Vec4),
        UniformKind::Mat4 => floats()?.try_into().ok().map(UniformValue::Mat4),
        UniformKind::Sampler2D => v.as_u64().map(|u| UniformValue::Texture(u as u32)),
        UniformKind::Other => None,
    }
}

fn tag_fits(kind: UniformKind, tag_kind: Option<ValueKind>) -> bool {
    let scalar = matches!(kind, UniformKind::Float | UniformKind::Int | UniformKind::Bool);
    scalar && tag_kind != Some(ValueKind::String)
}

/// Declared uniforms of one linked program, with their resolved sources.
#[derive(Debug, Clone, Default)]
pub struct ShaderUniforms {
    uniforms: Vec<ShaderUniform>,
    /// Declared-tag count when naming-convention bindings were last resolved.
    tags_seen: usize,
}

impl ShaderUniforms {
    /// Resolve every active uniform: explicit binding, then constant, then built-in, then the
    /// `category_tag` / `u_category_tag` naming convention.
    pub fn resolve(
        active: Vec<ActiveUniform>,
        bindings: &UniformBindings,
        snap: &RegistrySnapshot,
    ) -> Self {
        let conventions = convention_index(snap);
        let mut uniforms = Vec::with_capacity(active.len());

        for a in active {
            let source = if let Some(tag) = bindings.explicit.get(&a.name) {
                match QualifiedTag::parse(tag) {
                    Ok(q) => {
                        let decl = snap.tag(q.as_str());
                        if tag_fits(a.kind, decl.map(|d| d.kind)) {
                            UniformSource::Tag {
                                smoothing: decl.map(|d| d.smoothing).unwrap_or(0.0),
                                tag: q,
                            }
                        } else {
                            crate::logw!("SHADER", "uniform '{}' cannot take tag '{tag}'", a.name);
                            UniformSource::Unbound
                        }
                    }
                    Err(e) => {
                        crate::logw!("SHADER", "binding for '{}': {e}", a.name);
                        UniformSource::Unbound
                    }
                }
            } else if let Some(c) = bindings.constants.get(&a.name) {
                match constant_value(a.kind, c) {
                    Some(v) => UniformSource::Constant(v),
                    None => {
                        crate::logw!("SHADER", "constant for '{}' does not fit {:?}", a.name, a.kind);
                        UniformSource::Unbound
                    }
                }
            } else if let Some(b) = Builtin::for_name(&a.name) {
                UniformSource::Builtin(b)
            } else {
                convention_source(&a.name, a.kind, &conventions)
            };
            uniforms.push(ShaderUniform::new(a, source));
        }

        let out = Self {
            uniforms,
            tags_seen: snap.tag_count(),
        };
        for u in &out.uniforms {
            crate::logi!("SHADER", "uniform {} ({:?}) <- {}", u.name, u.kind, describe(&u.source));
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShaderUniform> {
        self.uniforms.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ShaderUniform> {
        self.uniforms.iter().find(|u| u.name == name)
    }

    pub fn len(&self) -> usize {
        self.uniforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uniforms.is_empty()
    }

    /// Bind still-unbound uniforms to tags declared since the last resolution.
    fn rebind_new_tags(&mut self, snap: &RegistrySnapshot) {
        self.tags_seen = snap.tag_count();
        if !self.uniforms.iter().any(|u| u.source == UniformSource::Unbound) {
            return;
        }
        let conventions = convention_index(snap);
        for u in self.uniforms.iter_mut().filter(|u| u.source == UniformSource::Unbound) {
            let source = convention_source(&u.name, u.kind, &conventions);
            if source != UniformSource::Unbound {
                crate::logi!("SHADER", "uniform {} <- {}", u.name, describe(&source));
                u.source = source;
            }
        }
    }

    /// Push every uniform whose value changed. Returns the number of values sent.
    pub fn update<B: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut B,
        snap: &RegistrySnapshot,
        ctx: &FrameContext,
    ) -> usize {
        if snap.tag_count() != self.tags_seen {
            self.rebind_new_tags(snap);
        }

        let mut pushed = 0;
        for u in &mut self.uniforms {
            let value = match &u.source {
                UniformSource::Unbound => continue,
                UniformSource::Constant(v) => Some(*v),
                UniformSource::Builtin(b) => builtin_value(*b, u.kind, ctx),
                UniformSource::Tag { tag, smoothing } => {
                    let smoothing = *smoothing;
                    match snap.get(tag.as_str()) {
                        Some(item) => {
                            let v = item.value.clone();
                            u.tag_value(&v, smoothing)
                        }
                        None => None,
                    }
                }
            };
            let Some(value) = value else {
                continue;
            };
            if u.last == Some(value) {
                continue;
            }
            gpu.set_uniform(u.location, &value);
            u.last = Some(value);
            pushed += 1;
        }
        pushed
    }
}

fn describe(src: &UniformSource) -> String {
    match src {
        UniformSource::Tag { tag, smoothing } => format!("tag {tag} (smoothing {smoothing})"),
        UniformSource::Constant(v) => format!("constant {v:?}"),
        UniformSource::Builtin(b) => format!("builtin {b:?}"),
        UniformSource::Unbound => "unbound".to_string(),
    }
}

/// GLSL identifier -> (tag, kind, smoothing) for every declared tag.
fn convention_index(snap: &RegistrySnapshot) -> HashMap<String, (QualifiedTag, ValueKind, f32)> {
    snap.iter_tags()
        .map(|t| (t.qualified.uniform_ident(), (t.qualified.clone(), t.kind, t.smoothing)))
        .collect()
}

fn convention_source(
    name: &str,
    kind: UniformKind,
    index: &HashMap<String, (QualifiedTag, ValueKind, f32)>,
) -> UniformSource {
    let hit = index
        .get(name)
        .or_else(|| name.strip_prefix("u_").and_then(|n| index.get(n)));
    match hit {
        Some((tag, tag_kind, smoothing)) if tag_fits(kind, Some(*tag_kind)) => UniformSource::Tag {
            tag: tag.clone(),
            smoothing: *smoothing,
        },
        _ => UniformSource::Unbound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataSources, DataTag};
    use crate::shader::HeadlessBackend;

    fn active(name: &str, kind: UniformKind, loc: u32) -> ActiveUniform {
        ActiveUniform {
            name: name.into(),
            kind,
            location: UniformLocation(loc),
        }
    }

    fn registry_with_level(smoothing: f32) -> (DataSources, crate::registry::DataSource) {
        let reg = DataSources::new();
        reg.declare_tag(
            DataTag::new(QualifiedTag::parse("synth/level").unwrap(), ValueKind::Float)
                .with_smoothing(smoothing),
        )
        .unwrap();
        let src = reg.register_source("host").unwrap();
        (reg, src)
    }

    #[test]
    fn builtin_names() {
        assert_eq!(Builtin::for_name("u_time"), Some(Builtin::Time));
        assert_eq!(Builtin::for_name("u_palette4"), Some(Builtin::Palette(4)));
        assert_eq!(Builtin::for_name("u_palette5"), None);
        assert_eq!(Builtin::for_name("u_other"), None);
    }

    #[test]
    fn resolution_order() {
        let (reg, _src) = registry_with_level(0.0);
        let mut bindings = UniformBindings::default();
        bindings.explicit.insert("brightness".into(), "synth/level".into());
        bindings.constants.insert("u_gain".into(), serde_json::json!(2.0));

        let u = ShaderUniforms::resolve(
            vec![
                active("brightness", UniformKind::Float, 1),
                active("u_gain", UniformKind::Float, 2),
                active("u_time", UniformKind::Float, 3),
                active("u_synth_level", UniformKind::Float, 4),
                active("synth_level", UniformKind::Float, 5),
                active("u_mystery", UniformKind::Float, 6),
            ],
            &bindings,
            &reg.snapshot(),
        );

        let tag = QualifiedTag::parse("synth/level").unwrap();
        let bound = UniformSource::Tag { tag, smoothing: 0.0 };
        assert_eq!(u.get("brightness").unwrap().source, bound);
        assert_eq!(
            u.get("u_gain").unwrap().source,
            UniformSource::Constant(UniformValue::Float(2.0))
        );
        assert_eq!(u.get("u_time").unwrap().source, UniformSource::Builtin(Builtin::Time));
        assert_eq!(u.get("u_synth_level").unwrap().source, bound);
        assert_eq!(u.get("synth_level").unwrap().source, bound);
        assert_eq!(u.get("u_mystery").unwrap().source, UniformSource::Unbound);
    }

    #[test]
    fn identical_values_are_not_resent() {
        let (reg, src) = registry_with_level(0.0);
        src.set("synth/level", Value::Float(0.5)).unwrap();
        let mut gpu = HeadlessBackend::new();
        let mut u = ShaderUniforms::resolve(
            vec![active("u_synth_level", UniformKind::Float, 1)],
            &UniformBindings::default(),
            &reg.snapshot(),
        );

        let ctx = FrameContext::default();
        assert_eq!(u.update(&mut gpu, &reg.snapshot(), &ctx), 1);
        assert_eq!(u.update(&mut gpu, &reg.snapshot(), &ctx), 0);
        src.set("synth/level", Value::Float(0.75)).unwrap();
        assert_eq!(u.update(&mut gpu, &reg.snapshot(), &ctx), 1);
        assert_eq!(u.get("u_synth_level").unwrap().last, Some(UniformValue::Float(0.75)));
    }

    #[test]
    fn smoothing_approaches_target() {
        let (reg, src) = registry_with_level(0.5);
        let mut gpu = HeadlessBackend::new();
        let mut u = ShaderUniforms::resolve(
            vec![active("u_synth_level", UniformKind::Float, 1)],
            &UniformBindings::default(),
            &reg.snapshot(),
        );
        let ctx = FrameContext::default();

        src.set("synth/level", Value::Float(0.0)).unwrap();
        u.update(&mut gpu, &reg.snapshot(), &ctx);
        src.set("synth/level", Value::Float(1.0)).unwrap();
        u.update(&mut gpu, &reg.snapshot(), &ctx);
        assert_eq!(u.get("u_synth_level").unwrap().last, Some(UniformValue::Float(0.5)));
        u.update(&mut gpu, &reg.snapshot(), &ctx);
        assert_eq!(u.get("u_synth_level").unwrap().last, Some(UniformValue::Float(0.75)));
    }

    #[test]
    fn late_declared_tag_gets_bound() {
        let reg = DataSources::new();
        let osc = reg.register_source("osc:9000").unwrap();
        let mut gpu = HeadlessBackend::new();
        let mut u = ShaderUniforms::resolve(
            vec![active("u_fx_mix", UniformKind::Float, 1)],
            &UniformBindings::default(),
            &reg.snapshot(),
        );
        assert_eq!(u.get("u_fx_mix").unwrap().source, UniformSource::Unbound);

        osc.set_or_declare("fx/mix", Value::Float(0.3)).unwrap();
        let pushed = u.update(&mut gpu, &reg.snapshot(), &FrameContext::default());
        assert_eq!(pushed, 1);
        assert_eq!(u.get("u_fx_mix").unwrap().last, Some(UniformValue::Float(0.3)));
    }

    #[test]
    fn string_tags_do_not_bind_to_numeric_uniforms() {
        let reg = DataSources::new();
        reg.declare_tag(DataTag::new(
            QualifiedTag::parse("meta/title").unwrap(),
            ValueKind::String,
        ))
        .unwrap();
        let u = ShaderUniforms::resolve(
            vec![active("u_meta_title", UniformKind::Float, 1)],
            &UniformBindings::default(),
            &reg.snapshot(),
        );
        assert_eq!(u.get("u_meta_title").unwrap().source, UniformSource::Unbound);
    }

    #[test]
    fn constants_by_kind() {
        assert_eq!(
            constant_value(UniformKind::Vec3, &serde_json::json!([1.0, 0.5, 0.0])),
            Some(UniformValue::Vec3([1.0, 0.5, 0.0]))
        );
        assert_eq!(constant_value(UniformKind::Vec3, &serde_json::json!([1.0])), None);
        assert_eq!(
            constant_value(UniformKind::Bool, &serde_json::json!(true)),
            Some(UniformValue::Int(1))
        );
    }
}
