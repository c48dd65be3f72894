// monitor.rs — Flow observation by socket-table polling.
//
// Scans `/proc/net/{tcp,tcp6,udp,udp6}` and diffs against the previous scan.
// New outbound sockets become `ObservedFlow`s; sockets that disappeared are
// reported as closed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use aw_rules::Protocol;

use crate::attributor::{parse_socket_table, SocketEntry};
use crate::error::AgentError;
use crate::flow::{FlowId, FlowKey, ObservedFlow};

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_SYN_SENT: u8 = 0x02;
const TCP_LISTEN: u8 = 0x0A;

/// Changes since the last poll.
#[derive(Debug, Default)]
pub struct MonitorEvents {
    pub opened: Vec<ObservedFlow>,
    pub closed: Vec<FlowId>,
}

pub struct SocketMonitor {
    root: PathBuf,
    seen: HashMap<FlowKey, FlowId>,
}

impl SocketMonitor {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: HashMap::new(),
        }
    }

    pub fn poll(&mut self) -> Result<MonitorEvents, AgentError> {
        let mut current = HashSet::new();
        for (table, protocol) in [
            ("tcp", Protocol::Tcp),
            ("tcp6", Protocol::Tcp),
            ("udp", Protocol::Udp),
            ("udp6", Protocol::Udp),
        ] {
            let path = self.root.join("net").join(table);
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AgentError::io(path, e)),
            };
            let entries = parse_socket_table(&content);
            let listening: HashSet<u16> = entries
                .iter()
                .filter(|e| protocol == Protocol::Tcp && e.state == TCP_LISTEN)
                .map(|e| e.local.1)
                .collect();
            current.extend(
                entries
                    .iter()
                    .filter(|e| is_outbound(e, protocol, &listening))
                    .map(|e| FlowKey {
                        protocol,
                        local_ip: e.local.0,
                        local_port: e.local.1,
                        remote_ip: e.remote.0,
                        remote_port: e.remote.1,
                    }),
            );
        }

        let mut events = MonitorEvents::default();
        self.seen.retain(|key, flow_id| {
            let keep = current.contains(key);
            if !keep {
                events.closed.push(*flow_id);
            }
            keep
        });
        for key in current {
            if !self.seen.contains_key(&key) {
                let flow = ObservedFlow::new(key);
                self.seen.insert(key, flow.flow_id);
                events.opened.push(flow);
            }
        }
        Ok(events)
    }
}

impl Default for SocketMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_outbound(entry: &SocketEntry, protocol: Protocol, listening: &HashSet<u16>) -> bool {
    let (remote_ip, remote_port) = entry.remote;
    if remote_port == 0 || remote_ip.is_unspecified() || remote_ip.is_loopback() {
        return false;
    }
    match protocol {
        Protocol::Tcp => {
            (entry.state == TCP_ESTABLISHED || entry.state == TCP_SYN_SENT)
                && !listening.contains(&entry.local.1)
        }
        _ => true,
    }
}
