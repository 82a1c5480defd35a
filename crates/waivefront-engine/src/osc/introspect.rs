// Read-only OSC query endpoints.
//
// With the default control prefix "/waivefront":
//   /waivefront/list/tags              -> /waivefront/reply/list/tags        (qualified tag names)
//   /waivefront/list/categories        -> /waivefront/reply/list/categories  (category names)
//   /waivefront/list/sources           -> /waivefront/reply/list/sources     (source names)
//   /waivefront/get/<category>/<tag>   -> /waivefront/reply/get/<category>/<tag>
//                                         (value, source) or ("unknown_tag")
//   /waivefront/stats                  -> /waivefront/reply/stats            (counters as ints)
//
// Replies go back to the sender. Nothing here writes to the registry.

use std::net::{SocketAddr, UdpSocket};

use rosc::{OscPacket, OscType};

use super::message::value_to_osc;
use super::OscStats;
use crate::registry::RegistrySnapshot;

pub(crate) fn send_reply(sock: &UdpSocket, to: SocketAddr, addr: String, args: Vec<OscType>) {
    let pkt = OscPacket::Message(rosc::OscMessage { addr, args });
    match rosc::encoder::encode(&pkt) {
        Ok(buf) => {
            if let Err(e) = sock.send_to(&buf, to) {
                crate::logw!("OSC", "reply to {to} failed: {e}");
            }
        }
        Err(e) => crate::logw!("OSC", "reply encode error: {e}"),
    }
}

/// Answer a query addressed below the control prefix. `rest` is the address with the control
/// prefix removed (e.g. `/list/tags`). Returns false when `rest` names no known query.
pub(crate) fn answer(
    control_prefix: &str,
    rest: &str,
    snap: &RegistrySnapshot,
    stats: &OscStats,
    sock: &UdpSocket,
    to: SocketAddr,
) -> bool {
    let rest = rest.trim_end_matches('/');
    match rest {
        "/list" | "/list/tags" => {
            let args = snap
                .iter_tags()
                .map(|t| OscType::String(t.qualified.to_string()))
                .collect::<Vec<_>>();
            crate::logi!("OSC", "introspect list/tags -> {} items", args.len());
            send_reply(sock, to, format!("{control_prefix}/reply/list/tags"), args);
            true
        }
        "/list/categories" => {
            let args = snap
                .categories()
                .into_iter()
                .map(|c| OscType::String(c.name.clone()))
                .collect();
            send_reply(sock, to, format!("{control_prefix}/reply/list/categories"), args);
            true
        }
        "/list/sources" => {
            let args = snap
                .sources()
                .into_iter()
                .map(|s| OscType::String(s.to_string()))
                .collect();
            send_reply(sock, to, format!("{control_prefix}/reply/list/sources"), args);
            true
        }
        "/stats" => {
            let to_int = |v: u64| OscType::Int(i32::try_from(v).unwrap_or(i32::MAX));
            let args = vec![
                to_int(stats.received),
                to_int(stats.dispatched),
                to_int(stats.malformed),
                to_int(stats.rejected),
                to_int(stats.introspection),
            ];
            send_reply(sock, to, format!("{control_prefix}/reply/stats"), args);
            true
        }
        _ => {
            let Some(tag) = rest.strip_prefix("/get/") else {
                return false;
            };
            let reply_addr = format!("{control_prefix}/reply/get/{tag}");
            match snap.get(tag) {
                Some(item) => {
                    crate::logi!("OSC", "introspect get/{tag} -> {} ({})", item.value, item.source);
                    send_reply(
                        sock,
                        to,
                        reply_addr,
                        vec![value_to_osc(&item.value), OscType::String(item.source.to_string())],
                    );
                }
                None => {
                    crate::logi!("OSC", "introspect get/{tag} -> unknown_tag");
                    send_reply(sock, to, reply_addr, vec![OscType::String("unknown_tag".into())]);
                }
            }
            true
        }
    }
}
