use std::net::UdpSocket;
use std::time::{Duration, Instant};

use rosc::{OscMessage, OscPacket, OscType};

use waivefront_engine::config::ParamsJson;
use waivefront_engine::osc::OscConfig;
use waivefront_engine::shader::{HeadlessBackend, ShaderSource, UniformValue, DEFAULT_VERTEX};
use waivefront_engine::video::{MemoryDecoder, Pacing, VideoConfig};
use waivefront_engine::{Engine, EngineEvent, Value};

const FRAG: &str = "#version 330 core
uniform float u_synth_level;
uniform sampler2D u_texture;
in vec2 v_uv;
out vec4 frag;
void main() {
    frag = texture(u_texture, v_uv) * u_synth_level;
}
";

const FRAME0: [u8; 4] = [10, 20, 30, 255];
const FRAME1: [u8; 4] = [200, 100, 50, 255];

fn wait_for(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn send(to: std::net::SocketAddr, addr: &str, args: Vec<OscType>) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let pkt = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    let bytes = rosc::encoder::encode(&pkt).unwrap();
    sock.send_to(&bytes, to).unwrap();
}

fn params() -> ParamsJson {
    serde_json::from_str(
        r#"{
            "categories": [ { "name": "synth" } ],
            "tags": [ { "category": "synth", "name": "level", "type": "float" } ]
        }"#,
    )
    .unwrap()
}

#[test]
fn osc_value_and_video_frames_reach_the_gpu() {
    let mut engine: Engine<HeadlessBackend> =
        Engine::new(ShaderSource::inline(DEFAULT_VERTEX, FRAG)).unwrap();
    engine.declare_params(&params()).unwrap();

    let osc = engine
        .start_osc(&OscConfig {
            bind: "127.0.0.1:0".into(),
            ..OscConfig::default()
        })
        .unwrap();

    let decoder = MemoryDecoder::solid_frames(2, 2, 30.0, &[FRAME0, FRAME1]).unwrap();
    let cfg = VideoConfig {
        pacing: Pacing::Stepped,
        ..VideoConfig::default()
    };
    engine.open_video_with(Box::new(decoder), "two-frames", &cfg).unwrap();

    let gpu = HeadlessBackend::new();
    let probe = gpu.probe();
    engine.bind_surface(gpu, 320, 240).unwrap();

    send(osc, "/synth/level", vec![OscType::Float(0.5)]);
    assert!(wait_for(|| engine.registry().get("synth/level").map(|(v, _)| v)
        == Some(Value::Float(0.5))));

    engine.advance_video();
    let video = engine.video().unwrap();
    assert!(wait_for(|| video.frames_published() == 1));

    let r = engine.tick().unwrap();
    assert!(r.drew && r.uploaded);
    assert_eq!(probe.uniform("u_synth_level"), Some(UniformValue::Float(0.5)));
    assert_eq!(probe.bound_texture_pixels(0), Some(FRAME0.repeat(4)));

    engine.advance_video();
    let video = engine.video().unwrap();
    assert!(wait_for(|| video.frames_published() == 2));

    let r = engine.tick().unwrap();
    assert!(r.uploaded);
    assert_eq!(probe.bound_texture_pixels(0), Some(FRAME1.repeat(4)));
    assert_eq!(probe.uniform("u_synth_level"), Some(UniformValue::Float(0.5)));

    // No new frame: the texture is reused.
    let uploads = probe.upload_count();
    for _ in 0..2 {
        let r = engine.tick().unwrap();
        assert!(r.drew);
        assert!(!r.uploaded);
    }
    assert_eq!(probe.upload_count(), uploads);
    assert_eq!(engine.texture_upload_count(), 2);
}

#[test]
fn malformed_osc_leaves_registry_untouched() {
    let mut engine: Engine<HeadlessBackend> =
        Engine::new(ShaderSource::inline(DEFAULT_VERTEX, FRAG)).unwrap();
    engine.declare_params(&params()).unwrap();
    let osc = engine
        .start_osc(&OscConfig {
            bind: "127.0.0.1:0".into(),
            ..OscConfig::default()
        })
        .unwrap();
    let before = engine.registry().snapshot().revision();

    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.send_to(b"definitely not osc", osc).unwrap();
    send(osc, "/synth/level", vec![]);
    send(osc, "/synth/level", vec![OscType::Int(3)]);

    assert!(wait_for(|| {
        let s = engine.osc_stats().unwrap_or_default();
        s.malformed == 2 && s.rejected == 1
    }));
    assert_eq!(engine.registry().snapshot().revision(), before);
    assert!(engine.registry().get("synth/level").is_none());
}

#[test]
fn events_report_bind_and_loader_state() {
    let mut engine: Engine<HeadlessBackend> =
        Engine::new(ShaderSource::inline(DEFAULT_VERTEX, FRAG)).unwrap();
    let events = engine.events();
    let osc = engine
        .start_osc(&OscConfig {
            bind: "127.0.0.1:0".into(),
            ..OscConfig::default()
        })
        .unwrap();
    let decoder = MemoryDecoder::solid_frames(2, 2, 30.0, &[FRAME0]).unwrap();
    let cfg = VideoConfig {
        pacing: Pacing::Free,
        loop_playback: false,
        ..VideoConfig::default()
    };
    engine.open_video_with(Box::new(decoder), "one-frame", &cfg).unwrap();
    engine.bind_surface(HeadlessBackend::new(), 16, 16).unwrap();

    let video = engine.video().unwrap();
    assert!(wait_for(|| video.status().as_str() == "ended"));
    engine.tick().unwrap();

    let got: Vec<EngineEvent> = events.try_iter().collect();
    assert!(got
        .iter()
        .any(|e| matches!(e, EngineEvent::OscBound { addr, .. } if *addr == osc)));
    assert!(got.iter().any(|e| matches!(e, EngineEvent::ShaderCompileOk { .. })));
    assert!(got.iter().any(|e| matches!(
        e,
        EngineEvent::LoaderState { label, .. } if label == "one-frame"
    )));
}
