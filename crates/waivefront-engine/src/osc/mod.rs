//! OSC input (UDP)
//!
//! One background thread per server: it receives datagrams, decodes them with `rosc`, and
//! routes each message through a handler table keyed by address prefix. Parameter messages
//! become registry writes on the server's own data source (`osc:<port>`); messages below the
//! control prefix are read-only introspection queries answered to the sender.
//!
//! Per-packet problems never stop the loop: they are logged and counted.

mod introspect;
mod message;

pub use message::{osc_to_value, split_address, value_to_osc, AddressError, OscMessage};

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use rosc::OscPacket;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::registry::{ControlOrigin, DataSource, DataSources};

/// Receive timeout; bounds how long `stop()` takes to be observed.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// `osc` block of `params.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub enabled: bool,
    /// UDP endpoint, e.g. `0.0.0.0:9000`.
    pub bind: String,
    /// Stripped from parameter addresses before category/tag mapping (empty = none).
    pub prefix: String,
    /// Root of the introspection endpoints.
    pub control_prefix: String,
    pub introspection: bool,
    /// If non-empty, only these categories are accepted.
    pub categories: Vec<String>,
    /// Declare unknown tags from the first value received for them.
    pub auto_declare: bool,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:9000".to_string(),
            prefix: String::new(),
            control_prefix: "/waivefront".to_string(),
            introspection: true,
            categories: Vec::new(),
            auto_declare: true,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OscStats {
    /// Datagrams received.
    pub received: u64,
    /// Messages that became registry writes.
    pub dispatched: u64,
    /// Undecodable packets and messages with unusable address or arguments.
    pub malformed: u64,
    /// Well-formed messages refused by routing, the category allow-list, or the registry.
    pub rejected: u64,
    pub introspection: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    introspection: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> OscStats {
        OscStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            introspection: self.introspection.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        let c = match outcome {
            Outcome::Dispatched => &self.dispatched,
            Outcome::Malformed => &self.malformed,
            Outcome::Rejected => &self.rejected,
            Outcome::Introspected => &self.introspection,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Dispatched,
    Malformed,
    Rejected,
    Introspected,
}

/// Everything a handler may touch. Owned by the receive thread.
struct Ingest {
    cfg: OscConfig,
    source: DataSource,
    registry: DataSources,
    sock: UdpSocket,
    counters: Arc<Counters>,
}

/// Handler for messages under one address prefix; `rest` is the address with that prefix
/// removed.
type Handler = fn(&Ingest, &OscMessage, &str, SocketAddr) -> Outcome;

struct Route {
    prefix: String,
    name: &'static str,
    handler: Handler,
}

/// Address-prefix routing table. Longest prefix wins.
struct HandlerTable {
    routes: Vec<Route>,
}

impl HandlerTable {
    fn for_config(cfg: &OscConfig) -> Self {
        let mut routes = Vec::new();
        if cfg.introspection {
            routes.push(Route {
                prefix: normalize_prefix(&cfg.control_prefix),
                name: "introspection",
                handler: handle_introspection,
            });
        }
        routes.push(Route {
            prefix: normalize_prefix(&cfg.prefix),
            name: "parameter",
            handler: handle_parameter,
        });
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    fn lookup<'a>(&self, addr: &'a str) -> Option<(&Route, &'a str)> {
        self.routes.iter().find_map(|route| {
            if route.prefix.is_empty() {
                return Some((route, addr));
            }
            let rest = addr.strip_prefix(route.prefix.as_str())?;
            // Match whole segments only: "/wf" must not claim "/wfx/...".
            if rest.is_empty() || rest.starts_with('/') {
                Some((route, rest))
            } else {
                None
            }
        })
    }
}

/// `"waivefront/"` -> `"/waivefront"`, `"/"` -> `""`.
fn normalize_prefix(p: &str) -> String {
    let p = p.trim().trim_end_matches('/');
    if p.is_empty() {
        String::new()
    } else if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

fn handle_parameter(ing: &Ingest, msg: &OscMessage, rest: &str, _from: SocketAddr) -> Outcome {
    let (category, tag) = match split_address(rest) {
        Ok(parts) => parts,
        Err(e) => {
            crate::logw!("OSC", "dropping {}: {:?}", msg.addr, e);
            return Outcome::Malformed;
        }
    };

    if !ing.cfg.categories.is_empty() && !ing.cfg.categories.iter().any(|c| c == category) {
        crate::logw!("OSC", "category '{category}' not accepted ({})", msg.addr);
        return Outcome::Rejected;
    }

    let Some(value) = msg.first_value() else {
        crate::logw!(
            "OSC",
            "dropping {}: {}",
            msg.addr,
            if msg.args.is_empty() { "no arguments" } else { "unsupported argument type" }
        );
        return Outcome::Malformed;
    };

    let qualified = format!("{category}/{tag}");
    if let Some(declared) = ing.registry.tag(&qualified) {
        if declared.control != ControlOrigin::Osc {
            crate::logw!(
                "OSC",
                "{} rejected: '{qualified}' is controlled by {}",
                msg.addr,
                declared.control.as_str()
            );
            return Outcome::Rejected;
        }
    }

    let res = if ing.cfg.auto_declare {
        ing.source.set_or_declare(&qualified, value)
    } else {
        ing.source.set(&qualified, value)
    };
    match res {
        Ok(()) => Outcome::Dispatched,
        Err(e) => {
            crate::logw!("OSC", "{} rejected: {e}", msg.addr);
            Outcome::Rejected
        }
    }
}

fn handle_introspection(ing: &Ingest, msg: &OscMessage, rest: &str, from: SocketAddr) -> Outcome {
    let snap = ing.registry.snapshot();
    let stats = ing.counters.snapshot();
    let control_prefix = normalize_prefix(&ing.cfg.control_prefix);
    if introspect::answer(&control_prefix, rest, &snap, &stats, &ing.sock, from) {
        Outcome::Introspected
    } else {
        crate::logw!("OSC", "unknown query {}", msg.addr);
        Outcome::Rejected
    }
}

fn handle_packet(ing: &Ingest, table: &HandlerTable, pkt: OscPacket, from: SocketAddr, at: Instant) {
    match pkt {
        OscPacket::Message(m) => {
            let msg = OscMessage::new(m, at);
            let outcome = if msg.addr.is_empty() || !msg.addr.starts_with('/') {
                Outcome::Malformed
            } else {
                match table.lookup(&msg.addr) {
                    Some((route, rest)) => (route.handler)(ing, &msg, rest, from),
                    None => Outcome::Rejected,
                }
            };
            ing.counters.record(outcome);
        }
        OscPacket::Bundle(b) => {
            for p in b.content {
                handle_packet(ing, table, p, from, at);
            }
        }
    }
}

/// Cloneable stop signal for an [`OscServer`]; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A running OSC receiver. Stops and joins its thread on drop, then unregisters its source.
pub struct OscServer {
    local_addr: SocketAddr,
    source_name: String,
    registry: DataSources,
    counters: Arc<Counters>,
    stop_tx: Sender<()>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl OscServer {
    /// Bind the endpoint, register `osc:<port>`, and start the receive thread.
    pub fn start(cfg: &OscConfig, registry: &DataSources) -> Result<Self> {
        let addr = cfg
            .bind
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| EngineError::Configuration(format!("invalid OSC endpoint '{}'", cfg.bind)))?;

        let sock = UdpSocket::bind(addr)
            .map_err(|e| EngineError::Configuration(format!("failed to bind OSC {addr}: {e}")))?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| EngineError::Configuration(format!("OSC socket setup failed: {e}")))?;
        let local_addr = sock
            .local_addr()
            .map_err(|e| EngineError::Configuration(format!("OSC socket setup failed: {e}")))?;

        let source_name = format!("osc:{}", local_addr.port());
        let source = registry.register_source(&source_name)?;

        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let ingest = Ingest {
            cfg: cfg.clone(),
            source,
            registry: registry.clone(),
            sock,
            counters: Arc::clone(&counters),
        };

        let join = std::thread::Builder::new()
            .name("osc".to_string())
            .spawn(move || receive_loop(ingest, stop_rx));
        let join = match join {
            Ok(j) => j,
            Err(e) => {
                let _ = registry.unregister_source(&source_name);
                return Err(EngineError::ResourceExhausted(format!("spawn osc thread: {e}")));
            }
        };

        crate::logi!(
            "OSC",
            "listening on {local_addr} prefix='{}' control='{}' introspection={}",
            cfg.prefix,
            cfg.control_prefix,
            cfg.introspection
        );

        Ok(Self {
            local_addr,
            source_name,
            registry: registry.clone(),
            counters,
            stop_tx,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn stats(&self) -> OscStats {
        self.counters.snapshot()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

impl Drop for OscServer {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        let _ = self.registry.unregister_source(&self.source_name);
    }
}

fn receive_loop(ingest: Ingest, stop_rx: Receiver<()>) {
    let table = HandlerTable::for_config(&ingest.cfg);
    for r in &table.routes {
        let shown = if r.prefix.is_empty() { "/" } else { r.prefix.as_str() };
        crate::logi!("OSC", "route {shown} -> {}", r.name);
    }
    let mut buf = vec![0u8; 65_536];
    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }

        match ingest.sock.recv_from(&mut buf) {
            Ok((sz, from)) => {
                let at = Instant::now();
                ingest.counters.received.fetch_add(1, Ordering::Relaxed);
                match rosc::decoder::decode_udp(&buf[..sz]) {
                    Ok((_rest, pkt)) => handle_packet(&ingest, &table, pkt, from, at),
                    Err(e) => {
                        ingest.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        crate::logw!("OSC", "undecodable packet from {from} ({sz} bytes): {e:?}");
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                crate::logw!("OSC", "recv error: {e}");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    crate::logi!("OSC", "stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataTag, QualifiedTag, Value, ValueKind};
    use rosc::OscType;

    fn loopback_cfg() -> OscConfig {
        OscConfig {
            bind: "127.0.0.1:0".into(),
            ..OscConfig::default()
        }
    }

    fn send(to: SocketAddr, addr: &str, args: Vec<OscType>) -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let pkt = OscPacket::Message(rosc::OscMessage {
            addr: addr.to_string(),
            args,
        });
        sock.send_to(&rosc::encoder::encode(&pkt).unwrap(), to).unwrap();
        sock
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn prefix_table_prefers_longest_whole_segment() {
        let cfg = OscConfig {
            prefix: "/wf".into(),
            control_prefix: "/wf/ctl".into(),
            ..OscConfig::default()
        };
        let table = HandlerTable::for_config(&cfg);
        let (route, rest) = table.lookup("/wf/ctl/list/tags").unwrap();
        assert_eq!(rest, "/list/tags");
        assert_eq!(route.name, "introspection");
        let (route, rest) = table.lookup("/wf/synth/level").unwrap();
        assert_eq!(rest, "/synth/level");
        assert_eq!(route.name, "parameter");
        assert!(table.lookup("/wfx/synth/level").is_none());
    }

    #[test]
    fn bad_endpoint_is_configuration_error() {
        let reg = DataSources::new();
        let cfg = OscConfig {
            bind: "not an endpoint".into(),
            ..OscConfig::default()
        };
        assert!(matches!(
            OscServer::start(&cfg, &reg),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn message_becomes_registry_value() {
        let reg = DataSources::new();
        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        send(server.local_addr(), "/synth/level", vec![OscType::Float(0.5)]);

        assert!(wait_until(|| reg.get("synth/level").is_some()));
        assert_eq!(reg.get("synth/level").unwrap().0, Value::Float(0.5));
        assert_eq!(server.stats().dispatched, 1);
        assert_eq!(
            reg.snapshot().get("synth/level").unwrap().source.as_ref(),
            server.source_name()
        );
    }

    #[test]
    fn malformed_packets_are_counted_and_ignored() {
        let reg = DataSources::new();
        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        let before = reg.snapshot().revision();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.send_to(b"\x00\x01garbage", server.local_addr()).unwrap();
        send(server.local_addr(), "/synth", vec![OscType::Float(1.0)]);
        send(server.local_addr(), "/synth/level", vec![]);

        assert!(wait_until(|| server.stats().malformed == 3));
        assert_eq!(reg.snapshot().revision(), before);
        assert!(server.is_running());
    }

    #[test]
    fn declared_type_mismatch_is_rejected() {
        let reg = DataSources::new();
        reg.declare_tag(DataTag::new(
            QualifiedTag::parse("synth/level").unwrap(),
            ValueKind::Float,
        ))
        .unwrap();
        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        send(server.local_addr(), "/synth/level", vec![OscType::String("x".into())]);

        assert!(wait_until(|| server.stats().rejected == 1));
        assert!(reg.get("synth/level").is_none());
    }

    #[test]
    fn host_controlled_tag_ignores_osc_writes() {
        let reg = DataSources::new();
        reg.declare_tag(
            DataTag::new(QualifiedTag::parse("host/bpm").unwrap(), ValueKind::Float)
                .with_control(ControlOrigin::Host),
        )
        .unwrap();
        let host = reg.register_source("host").unwrap();
        host.set("host/bpm", Value::Float(90.0)).unwrap();

        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        send(server.local_addr(), "/host/bpm", vec![OscType::Float(999.0)]);
        send(server.local_addr(), "/synth/level", vec![OscType::Float(0.5)]);

        assert!(wait_until(|| server.stats().dispatched == 1 && server.stats().rejected == 1));
        let (value, _) = reg.get("host/bpm").unwrap();
        assert_eq!(value, Value::Float(90.0));
        assert!(reg.get_from(server.source_name(), "host/bpm").is_none());
    }

    #[test]
    fn category_allow_list() {
        let reg = DataSources::new();
        let cfg = OscConfig {
            categories: vec!["synth".into()],
            ..loopback_cfg()
        };
        let server = OscServer::start(&cfg, &reg).unwrap();
        send(server.local_addr(), "/audio/gain", vec![OscType::Float(1.0)]);
        send(server.local_addr(), "/synth/level", vec![OscType::Float(1.0)]);

        assert!(wait_until(|| server.stats().dispatched == 1 && server.stats().rejected == 1));
        assert!(reg.get("audio/gain").is_none());
    }

    #[test]
    fn introspection_replies_to_sender() {
        let reg = DataSources::new();
        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        send(server.local_addr(), "/synth/level", vec![OscType::Float(0.25)]);
        assert!(wait_until(|| reg.get("synth/level").is_some()));

        let client = send(server.local_addr(), "/waivefront/get/synth/level", vec![]);
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut buf = [0u8; 1024];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let (_, pkt) = rosc::decoder::decode_udp(&buf[..n]).unwrap();
        match pkt {
            OscPacket::Message(m) => {
                assert_eq!(m.addr, "/waivefront/reply/get/synth/level");
                assert_eq!(m.args.first(), Some(&OscType::Float(0.25)));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(wait_until(|| server.stats().introspection == 1));
    }

    #[test]
    fn drop_unregisters_source() {
        let reg = DataSources::new();
        let server = OscServer::start(&loopback_cfg(), &reg).unwrap();
        let name = server.source_name().to_string();
        server.stop_handle().stop();
        drop(server);
        assert!(!reg.snapshot().sources().contains(&name.as_str()));
    }
}
