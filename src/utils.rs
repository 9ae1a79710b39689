use std::net::SocketAddr;

use crate::ID;

/// Human-readable connection identity used only in log lines, never on the
/// wire. Mirrors the `ip:port|session_id` convention the original router
/// used for its `peer` property.
pub fn peer_string(addr: Option<SocketAddr>, session_id: ID) -> String {
    match addr {
        Some(addr) => format!("{}:{}|{}", addr.ip(), addr.port(), session_id),
        None => format!("unknown:0|{}", session_id),
    }
}
