use std::path::Path;

use waivefront_engine::assets::AssetsRoot;
use waivefront_engine::config::{load_engine_config, ConfigMode};
use waivefront_engine::shader::{HeadlessBackend, UniformSource, UniformValue};
use waivefront_engine::{Engine, QualifiedTag, Value};

fn shipped() -> AssetsRoot {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../assets");
    AssetsRoot::at(&dir).unwrap()
}

#[test]
fn shipped_config_is_strictly_valid() {
    let cfg = load_engine_config(&shipped(), ConfigMode::Strict).unwrap();
    assert!(cfg.issues.is_empty(), "{:?}", cfg.issues);
    assert!(cfg.video.path.is_none());
    assert_eq!(cfg.params.osc.control_prefix, "/waivefront");
}

#[test]
fn shipped_shader_binds_declared_tags() {
    let cfg = load_engine_config(&shipped(), ConfigMode::Lenient).unwrap();
    let mut engine: Engine<HeadlessBackend> = Engine::new(cfg.render.shader_source().unwrap()).unwrap();
    engine.set_bindings(cfg.render.bindings.clone());
    engine.declare_params(&cfg.params).unwrap();

    let gpu = HeadlessBackend::new();
    let probe = gpu.probe();
    engine.bind_surface(gpu, 640, 360).unwrap();

    let uniforms = engine.program().unwrap().uniforms();
    let level = QualifiedTag::parse("synth/level").unwrap();
    assert!(matches!(
        &uniforms.get("u_brightness").unwrap().source,
        UniformSource::Tag { tag, .. } if *tag == level
    ));
    assert!(matches!(uniforms.get("u_fx_palette").unwrap().source, UniformSource::Tag { .. }));

    engine.tick().unwrap();
    assert_eq!(probe.uniform("u_brightness"), Some(UniformValue::Float(1.0)));
    assert_eq!(probe.uniform("u_tint"), Some(UniformValue::Vec3([1.0, 0.95, 0.9])));
    assert_eq!(probe.uniform("u_resolution"), Some(UniformValue::Vec2([640.0, 360.0])));

    engine.set_parameter("host/bpm", Value::Float(90.0)).unwrap();
    engine.tick().unwrap();
    assert_eq!(probe.uniform("u_host_bpm"), Some(UniformValue::Float(90.0)));
}
