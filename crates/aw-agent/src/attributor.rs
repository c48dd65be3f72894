// attributor.rs — Flow attribution: which application owns this socket?
//
// The OS lookup sits behind the `ProcessInspector` trait. `FlowAttributor`
// runs it on the blocking pool under a hard timeout and folds every failure
// into an `UnattributedReason`, so a slow or missing answer can never hold a
// flow open or let it through on an application rule.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use thiserror::Error;

use aw_audit::hasher;
use aw_rules::{
    ApplicationIdentity, ApplicationInstance, InstanceId, Protocol, Subject, UnattributedReason,
};

use crate::config::KnownApplication;
use crate::flow::{FlowKey, ObservedFlow};

/// The process that owns a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub exe: PathBuf,
    pub content_hash: Option<String>,
}

/// Why an OS lookup failed.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("permission denied reading {0}")]
    PermissionDenied(String),

    #[error("process {0} exited during lookup")]
    Exited(u32),

    #[error("inspection failed: {0}")]
    Io(String),
}

/// OS seam for socket ownership lookups. Implementations may block.
pub trait ProcessInspector: Send + Sync + 'static {
    /// Find the process owning the local socket of `key`.
    ///
    /// `Ok(None)` means the socket exists but no process holds it (or the
    /// socket is already gone).
    fn owner_of(&self, key: &FlowKey, pid_hint: Option<u32>)
        -> Result<Option<ProcessInfo>, InspectError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Result of attributing one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Attributed(ApplicationInstance),
    Unattributed(UnattributedReason),
}

impl Attribution {
    pub fn subject(&self) -> Subject<'_> {
        match self {
            Attribution::Attributed(instance) => Subject::Attributed(instance),
            Attribution::Unattributed(reason) => Subject::Unattributed(*reason),
        }
    }

    /// The owner disappeared mid-evaluation; nothing should be enforced.
    pub fn is_abandoned(&self) -> bool {
        matches!(
            self,
            Attribution::Unattributed(UnattributedReason::ProcessExited)
        )
    }

    pub fn instance(&self) -> Option<&ApplicationInstance> {
        match self {
            Attribution::Attributed(instance) => Some(instance),
            Attribution::Unattributed(_) => None,
        }
    }
}

/// Resolves flows to application instances and keeps the instance registry.
pub struct FlowAttributor {
    inspector: Arc<dyn ProcessInspector>,
    timeout: Duration,
    endpoint_id: String,
    /// Current instance per executable path.
    current: DashMap<PathBuf, ApplicationInstance>,
    /// Superseded instances, kept so old audit references stay resolvable.
    superseded: DashMap<InstanceId, ApplicationInstance>,
    known: HashMap<PathBuf, KnownApplication>,
}

impl FlowAttributor {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        endpoint_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inspector,
            timeout,
            endpoint_id: endpoint_id.into(),
            current: DashMap::new(),
            superseded: DashMap::new(),
            known: HashMap::new(),
        }
    }

    /// Name executables from a local catalog instead of their file name.
    pub fn with_known_applications(mut self, apps: impl IntoIterator<Item = KnownApplication>) -> Self {
        self.known = apps.into_iter().map(|a| (a.path.clone(), a)).collect();
        self
    }

    pub async fn attribute(&self, flow: &ObservedFlow) -> Attribution {
        let inspector = Arc::clone(&self.inspector);
        let key = flow.key;
        let hint = flow.pid_hint;
        let lookup = tokio::task::spawn_blocking(move || inspector.owner_of(&key, hint));

        let reason = match tokio::time::timeout(self.timeout, lookup).await {
            Err(_) => UnattributedReason::Timeout,
            Ok(Err(join_err)) => {
                tracing::warn!(flow = %flow.key, error = %join_err, "attribution task failed");
                UnattributedReason::InsufficientVisibility
            }
            Ok(Ok(Err(InspectError::Exited(_)))) => UnattributedReason::ProcessExited,
            Ok(Ok(Err(e))) => {
                tracing::debug!(flow = %flow.key, error = %e, "attribution lookup failed");
                UnattributedReason::InsufficientVisibility
            }
            Ok(Ok(Ok(None))) => UnattributedReason::NoOwner,
            Ok(Ok(Ok(Some(info)))) => {
                if !self.inspector.is_alive(info.pid) {
                    UnattributedReason::ProcessExited
                } else {
                    return Attribution::Attributed(self.resolve(info));
                }
            }
        };

        tracing::debug!(flow = %flow.key, reason = %reason, "flow unattributed");
        Attribution::Unattributed(reason)
    }

    /// Map a process to its instance, creating or superseding as needed.
    pub fn resolve(&self, info: ProcessInfo) -> ApplicationInstance {
        let known = self.known.get(&info.exe);
        let name = known.map(|k| k.name.clone()).unwrap_or_else(|| {
            info.exe
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| info.exe.display().to_string())
        });
        let mut identity = ApplicationIdentity::new(name);
        if let Some(publisher) = known.and_then(|k| k.publisher.clone()) {
            identity = identity.with_publisher(publisher);
        }
        if let Some(hash) = info.content_hash {
            identity = identity.with_content_hash(hash);
        }
        let version = known.and_then(|k| k.version.clone());

        let mut entry = self
            .current
            .entry(info.exe.clone())
            .or_insert_with(|| {
                let instance = ApplicationInstance::new(
                    identity.clone(),
                    self.endpoint_id.clone(),
                    info.exe.clone(),
                    version.clone(),
                );
                tracing::info!(
                    instance = %instance.instance_id,
                    application = %instance.identity,
                    path = %info.exe.display(),
                    "new application instance"
                );
                instance
            });

        if entry.identity.content_hash != identity.content_hash || entry.version != version {
            let next = ApplicationInstance::new(
                identity,
                self.endpoint_id.clone(),
                info.exe.clone(),
                version,
            );
            let mut old = std::mem::replace(&mut *entry, next.clone());
            old.supersede(next.instance_id);
            tracing::info!(
                old = %old.instance_id,
                new = %next.instance_id,
                path = %info.exe.display(),
                "application instance superseded"
            );
            self.superseded.insert(old.instance_id, old);
            return next;
        }

        entry.clone()
    }

    /// Every instance ever observed, current ones first.
    pub fn instances(&self) -> Vec<ApplicationInstance> {
        let mut all: Vec<_> = self.current.iter().map(|e| e.value().clone()).collect();
        all.extend(self.superseded.iter().map(|e| e.value().clone()));
        all
    }

    pub fn instance(&self, instance_id: InstanceId) -> Option<ApplicationInstance> {
        self.current
            .iter()
            .find(|e| e.value().instance_id == instance_id)
            .map(|e| e.value().clone())
            .or_else(|| self.superseded.get(&instance_id).map(|e| e.value().clone()))
    }
}

/// Linux `/proc` based inspector.
///
/// Socket tables (`net/tcp`, `net/tcp6`, `net/udp`, `net/udp6`) give the
/// inode of the local socket; `<pid>/fd` links reveal which process holds
/// it; `<pid>/exe` names and hashes the executable.
pub struct ProcInspector {
    root: PathBuf,
    hashes: DashMap<PathBuf, (u64, SystemTime, String)>,
}

impl ProcInspector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternate proc root (containers, tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hashes: DashMap::new(),
        }
    }

    fn socket_inode(&self, key: &FlowKey) -> Result<Option<u64>, InspectError> {
        let tables: &[&str] = match key.protocol {
            Protocol::Tcp => &["tcp", "tcp6"],
            Protocol::Udp => &["udp", "udp6"],
            Protocol::Icmp => return Ok(None),
        };
        for table in tables {
            let path = self.root.join("net").join(table);
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(InspectError::PermissionDenied(path.display().to_string()))
                }
                Err(e) => return Err(InspectError::Io(e.to_string())),
            };
            for entry in parse_socket_table(&content) {
                if entry.matches(key) {
                    return Ok(Some(entry.inode));
                }
            }
        }
        Ok(None)
    }

    fn holds_inode(&self, pid: u32, needle: &str) -> Result<bool, std::io::Error> {
        for fd in std::fs::read_dir(self.root.join(pid.to_string()).join("fd"))? {
            let Ok(fd) = fd else { continue };
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.as_os_str() == needle {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn find_owner(&self, inode: u64, pid_hint: Option<u32>) -> Result<Option<u32>, InspectError> {
        let needle = format!("socket:[{}]", inode);
        if let Some(pid) = pid_hint {
            if let Ok(true) = self.holds_inode(pid, &needle) {
                return Ok(Some(pid));
            }
        }

        let entries = std::fs::read_dir(&self.root).map_err(|e| InspectError::Io(e.to_string()))?;
        let mut denied = false;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            match self.holds_inode(pid, &needle) {
                Ok(true) => return Ok(Some(pid)),
                Ok(false) => {}
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => denied = true,
                Err(_) => {}
            }
        }
        if denied {
            return Err(InspectError::PermissionDenied(format!(
                "{}/*/fd",
                self.root.display()
            )));
        }
        Ok(None)
    }

    fn content_hash(&self, pid: u32, exe: &Path) -> Option<String> {
        let exe_link = self.root.join(pid.to_string()).join("exe");
        let meta = std::fs::metadata(&exe_link).ok()?;
        let modified = meta.modified().ok()?;
        if let Some(cached) = self.hashes.get(exe) {
            let (len, mtime, hash) = cached.value();
            if *len == meta.len() && *mtime == modified {
                return Some(hash.clone());
            }
        }
        match hasher::hash_file(&exe_link) {
            Ok(hash) => {
                self.hashes
                    .insert(exe.to_path_buf(), (meta.len(), modified, hash.clone()));
                Some(hash)
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "could not hash executable");
                None
            }
        }
    }
}

impl Default for ProcInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for ProcInspector {
    fn owner_of(
        &self,
        key: &FlowKey,
        pid_hint: Option<u32>,
    ) -> Result<Option<ProcessInfo>, InspectError> {
        let Some(inode) = self.socket_inode(key)? else {
            return Ok(None);
        };
        let Some(pid) = self.find_owner(inode, pid_hint)? else {
            return Ok(None);
        };
        let exe = match std::fs::read_link(self.root.join(pid.to_string()).join("exe")) {
            Ok(exe) => exe,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InspectError::Exited(pid))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(InspectError::PermissionDenied(format!("{}/exe", pid)))
            }
            Err(e) => return Err(InspectError::Io(e.to_string())),
        };
        let content_hash = self.content_hash(pid, &exe);
        Ok(Some(ProcessInfo {
            pid,
            exe,
            content_hash,
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.root.join(pid.to_string()).exists()
    }
}

/// One row of a `/proc/net/{tcp,udp}[6]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SocketEntry {
    pub local: (IpAddr, u16),
    pub remote: (IpAddr, u16),
    /// Kernel socket state (`01` established, `02` SYN sent, `0A` listen).
    pub state: u8,
    pub inode: u64,
}

impl SocketEntry {
    fn matches(&self, key: &FlowKey) -> bool {
        if self.local.1 != key.local_port || self.remote.1 != key.remote_port {
            return false;
        }
        same_addr(self.remote.0, key.remote_ip)
    }
}

fn same_addr(table: IpAddr, wanted: IpAddr) -> bool {
    match (table, wanted) {
        (IpAddr::V6(t), IpAddr::V4(w)) => t == w.to_ipv6_mapped(),
        (t, w) => t == w,
    }
}

pub(crate) fn parse_socket_table(content: &str) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            Some(SocketEntry {
                local: parse_endpoint(fields[1])?,
                remote: parse_endpoint(fields[2])?,
                state: u8::from_str_radix(fields[3], 16).ok()?,
                inode: fields[9].parse().ok()?,
            })
        })
        .collect()
}

fn parse_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(hex_word(addr)?)),
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                chunk.copy_from_slice(&hex_word(&addr[i * 8..i * 8 + 8])?);
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some((ip, port))
}

/// The kernel prints each 32-bit word in host byte order.
fn hex_word(s: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(s, 16).ok().map(u32::to_ne_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedInspector {
        result: fn() -> Result<Option<ProcessInfo>, InspectError>,
        delay: Duration,
        alive: bool,
        calls: AtomicUsize,
    }

    impl FixedInspector {
        fn new(result: fn() -> Result<Option<ProcessInfo>, InspectError>) -> Self {
            Self {
                result,
                delay: Duration::ZERO,
                alive: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ProcessInspector for FixedInspector {
        fn owner_of(
            &self,
            _key: &FlowKey,
            _pid_hint: Option<u32>,
        ) -> Result<Option<ProcessInfo>, InspectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            (self.result)()
        }

        fn is_alive(&self, _pid: u32) -> bool {
            self.alive
        }
    }

    fn curl() -> Result<Option<ProcessInfo>, InspectError> {
        Ok(Some(ProcessInfo {
            pid: 100,
            exe: PathBuf::from("/usr/bin/curl"),
            content_hash: Some("AAAA".into()),
        }))
    }

    fn flow() -> ObservedFlow {
        ObservedFlow::new(FlowKey {
            protocol: Protocol::Tcp,
            local_ip: "10.0.0.2".parse().unwrap(),
            local_port: 40000,
            remote_ip: "1.1.1.1".parse().unwrap(),
            remote_port: 443,
        })
    }

    fn attributor(inspector: FixedInspector) -> FlowAttributor {
        FlowAttributor::new(Arc::new(inspector), "e1", Duration::from_millis(100))
    }

    #[tokio::test]
    async fn attributes_to_instance_named_after_executable() {
        let attr = attributor(FixedInspector::new(curl));
        let Attribution::Attributed(instance) = attr.attribute(&flow()).await else {
            panic!("expected attribution");
        };
        assert_eq!(instance.identity.name, "curl");
        assert_eq!(instance.identity.content_hash.as_deref(), Some("aaaa"));
        assert_eq!(instance.endpoint_id, "e1");
    }

    #[tokio::test]
    async fn repeated_flows_reuse_the_instance() {
        let attr = attributor(FixedInspector::new(curl));
        let a = attr.attribute(&flow()).await;
        let b = attr.attribute(&flow()).await;
        assert_eq!(
            a.instance().unwrap().instance_id,
            b.instance().unwrap().instance_id
        );
        assert_eq!(attr.instances().len(), 1);
    }

    #[tokio::test]
    async fn slow_lookup_times_out() {
        let mut inspector = FixedInspector::new(curl);
        inspector.delay = Duration::from_millis(500);
        let attr = attributor(inspector);
        assert_eq!(
            attr.attribute(&flow()).await,
            Attribution::Unattributed(UnattributedReason::Timeout)
        );
    }

    #[tokio::test]
    async fn failures_map_to_reasons() {
        let attr = attributor(FixedInspector::new(|| Ok(None)));
        assert_eq!(
            attr.attribute(&flow()).await,
            Attribution::Unattributed(UnattributedReason::NoOwner)
        );

        let attr = attributor(FixedInspector::new(|| {
            Err(InspectError::PermissionDenied("/proc/1/fd".into()))
        }));
        assert_eq!(
            attr.attribute(&flow()).await,
            Attribution::Unattributed(UnattributedReason::InsufficientVisibility)
        );

        let attr = attributor(FixedInspector::new(|| Err(InspectError::Exited(7))));
        assert!(attr.attribute(&flow()).await.is_abandoned());
    }

    #[tokio::test]
    async fn owner_dying_after_lookup_abandons_the_flow() {
        let mut inspector = FixedInspector::new(curl);
        inspector.alive = false;
        let attr = attributor(inspector);
        assert!(attr.attribute(&flow()).await.is_abandoned());
        assert!(attr.instances().is_empty());
    }

    #[test]
    fn changed_hash_supersedes_instance() {
        let attr = attributor(FixedInspector::new(curl));
        let first = attr.resolve(curl().unwrap().unwrap());
        let mut updated = curl().unwrap().unwrap();
        updated.content_hash = Some("bbbb".into());
        let second = attr.resolve(updated);

        assert_ne!(first.instance_id, second.instance_id);
        let old = attr.instance(first.instance_id).unwrap();
        assert_eq!(old.superseded_by, Some(second.instance_id));
        assert!(attr.instance(second.instance_id).unwrap().is_current());
        assert_eq!(attr.instances().len(), 2);
    }

    #[test]
    fn known_applications_supply_name_and_publisher() {
        let attr = attributor(FixedInspector::new(curl)).with_known_applications(vec![
            KnownApplication {
                path: PathBuf::from("/usr/bin/curl"),
                name: "cURL".into(),
                publisher: Some("curl project".into()),
                version: Some("8.5".into()),
            },
        ]);
        let instance = attr.resolve(curl().unwrap().unwrap());
        assert_eq!(instance.identity.name, "cURL");
        assert_eq!(instance.identity.publisher.as_deref(), Some("curl project"));
        assert_eq!(instance.version.as_deref(), Some("8.5"));
    }

    #[test]
    fn parses_ipv4_and_ipv6_rows() {
        let v4 = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   \
                  0: 0100007F:0277 0101A8C0:01BB 01 00000000:00000000 00:00000000 00000000     0        0 12345 1 0 20 4 30 10 -1\n";
        let rows = parse_socket_table(v4);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].local, ("127.0.0.1".parse().unwrap(), 631));
        assert_eq!(rows[0].remote, ("192.168.1.1".parse().unwrap(), 443));
        assert_eq!(rows[0].inode, 12345);
        assert_eq!(rows[0].state, 1);

        let v6 = "header\n   0: 00000000000000000000000001000000:0016 0000000000000000FFFF00000101A8C0:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 999 1\n";
        let rows = parse_socket_table(v6);
        assert_eq!(rows[0].local, ("::1".parse().unwrap(), 22));
        assert!(same_addr(rows[0].remote.0, "192.168.1.1".parse().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn proc_inspector_follows_inode_to_executable() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::write(
            root.join("net/tcp"),
            "header\n   0: 0200000A:9C40 01010101:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 5555 1\n",
        )
        .unwrap();

        let exe = root.join("curl-bin");
        std::fs::write(&exe, b"binary").unwrap();
        std::fs::create_dir_all(root.join("4321/fd")).unwrap();
        symlink("socket:[5555]", root.join("4321/fd/3")).unwrap();
        symlink(&exe, root.join("4321/exe")).unwrap();

        let inspector = ProcInspector::with_root(root);
        let info = inspector.owner_of(&flow().key, None).unwrap().unwrap();
        assert_eq!(info.pid, 4321);
        assert_eq!(info.exe, exe);
        assert_eq!(info.content_hash, Some(hasher::hash_bytes(b"binary")));
        assert!(inspector.is_alive(4321));
        assert!(!inspector.is_alive(9999));
    }

    #[test]
    fn proc_inspector_without_matching_socket_reports_no_owner() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), "header\n").unwrap();
        let inspector = ProcInspector::with_root(dir.path());
        assert!(inspector.owner_of(&flow().key, None).unwrap().is_none());
    }
}
