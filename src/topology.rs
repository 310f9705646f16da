//! Task topology: port and backend-address extraction
//!
//! The discovery client hands us the raw list of running tasks each
//! round. This module derives the two things the reconciler needs from
//! it: which container ports the named container exposes, and which
//! "ip:port" backends currently serve each of those ports. Both are
//! folded into a [`Snapshot`], built atomically once per round and
//! superseded wholesale by the next round.

use std::collections::{BTreeMap, BTreeSet};

/// Transport protocol of a port binding. Bindings that do not state a
/// protocol are treated as TCP, matching the scheduler's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A container-port to host-port binding on one container instance.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

/// One named container within a task.
#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub last_status: String,
    pub bindings: Vec<PortBinding>,
}

impl Container {
    /// Whether the scheduler reports this container as running.
    pub fn running(&self) -> bool {
        self.last_status == "RUNNING"
    }

    /// Container-side ports bound for the given protocol.
    pub fn container_ports(&self, protocol: Protocol) -> Vec<u16> {
        self.bindings
            .iter()
            .filter(|b| b.protocol == protocol)
            .map(|b| b.container_port)
            .collect()
    }

    /// The host port a given container port is bound to, if any.
    pub fn resolve_port(&self, container_port: u16) -> Option<u16> {
        self.bindings
            .iter()
            .find(|b| b.container_port == container_port)
            .map(|b| b.host_port)
    }
}

/// A running task as reported by the topology source, reduced to what
/// the ambassador needs: its addresses and its containers' bindings.
#[derive(Debug, Clone)]
pub struct Task {
    pub arn: String,
    pub last_status: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub containers: Vec<Container>,
}

impl Task {
    /// Look up a container within this task by name.
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// The address clients should dial to reach this task.
    pub fn host_ip(&self, public: bool) -> Option<&str> {
        let ip = if public {
            self.public_ip.as_deref()
        } else {
            self.private_ip.as_deref()
        };
        ip.filter(|ip| !ip.is_empty())
    }
}

/// All TCP ports the named container listens on across the given tasks,
/// deduplicated. A container exposing the same port through multiple
/// bindings yields that port exactly once; only running containers
/// count.
pub fn container_ports(tasks: &[Task], container_name: &str) -> Vec<u16> {
    let mut seen = BTreeSet::new();
    let mut ports = Vec::new();
    for task in tasks {
        let Some(container) = task.container(container_name) else {
            continue;
        };
        if !container.running() {
            continue;
        }
        for port in container.container_ports(Protocol::Tcp) {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// The "ip:port" backend address for the given container port on every
/// task where the named container is running. Tasks without a bound
/// host port or without a resolvable address are skipped.
pub fn backend_addrs(tasks: &[Task], container_name: &str, port: u16, public: bool) -> Vec<String> {
    let mut addrs = Vec::new();
    for task in tasks {
        let Some(container) = task.container(container_name) else {
            continue;
        };
        if !container.running() {
            continue;
        }
        let Some(host_port) = container.resolve_port(port) else {
            continue;
        };
        let Some(ip) = task.host_ip(public) else {
            continue;
        };
        addrs.push(format!("{}:{}", ip, host_port));
    }
    addrs
}

/// The full point-in-time mapping from container port to the backends
/// currently serving it.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    ports: BTreeMap<u16, Vec<String>>,
}

impl Snapshot {
    /// Shape a snapshot from one round of discovered tasks. Ports with
    /// no currently resolvable backends still appear, with an empty
    /// list; the reconciler treats that differently from the port being
    /// absent altogether.
    pub fn build(tasks: &[Task], container_name: &str, public: bool) -> Self {
        let mut ports = BTreeMap::new();
        for port in container_ports(tasks, container_name) {
            ports.insert(port, backend_addrs(tasks, container_name, port, public));
        }
        Self { ports }
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn backends(&self, port: u16) -> Option<&Vec<String>> {
        self.ports.get(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Vec<String>)> {
        self.ports.iter().map(|(port, addrs)| (*port, addrs))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl FromIterator<(u16, Vec<String>)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (u16, Vec<String>)>>(iter: I) -> Self {
        Self {
            ports: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(container_port: u16, host_port: u16) -> PortBinding {
        PortBinding {
            container_port,
            host_port,
            protocol: Protocol::Tcp,
        }
    }

    fn task(arn: &str, ip: &str, container_name: &str, bindings: Vec<PortBinding>) -> Task {
        Task {
            arn: arn.to_string(),
            last_status: "RUNNING".to_string(),
            private_ip: Some(ip.to_string()),
            public_ip: None,
            containers: vec![Container {
                name: container_name.to_string(),
                last_status: "RUNNING".to_string(),
                bindings,
            }],
        }
    }

    #[test]
    fn ports_deduplicated_across_bindings_and_tasks() {
        let tasks = vec![
            task("t1", "10.0.0.1", "web", vec![binding(80, 32768), binding(80, 32769)]),
            task("t2", "10.0.0.2", "web", vec![binding(80, 32770), binding(8080, 32771)]),
        ];

        assert_eq!(container_ports(&tasks, "web"), vec![80, 8080]);
    }

    #[test]
    fn non_running_containers_ignored() {
        let mut stopped = task("t1", "10.0.0.1", "web", vec![binding(80, 32768)]);
        stopped.containers[0].last_status = "STOPPED".to_string();
        let tasks = vec![stopped, task("t2", "10.0.0.2", "web", vec![binding(80, 32769)])];

        assert_eq!(container_ports(&tasks, "web"), vec![80]);
        assert_eq!(backend_addrs(&tasks, "web", 80, false), vec!["10.0.0.2:32769"]);
    }

    #[test]
    fn udp_bindings_excluded_from_tcp_ports() {
        let mut t = task("t1", "10.0.0.1", "web", vec![binding(80, 32768)]);
        t.containers[0].bindings.push(PortBinding {
            container_port: 53,
            host_port: 32800,
            protocol: Protocol::Udp,
        });

        assert_eq!(container_ports(&[t], "web"), vec![80]);
    }

    #[test]
    fn unknown_container_name_yields_nothing() {
        let tasks = vec![task("t1", "10.0.0.1", "web", vec![binding(80, 32768)])];

        assert!(container_ports(&tasks, "db").is_empty());
        assert!(backend_addrs(&tasks, "db", 80, false).is_empty());
    }

    #[test]
    fn backend_addrs_use_host_port_and_selected_ip() {
        let mut t = task("t1", "10.0.0.1", "web", vec![binding(80, 32768)]);
        t.public_ip = Some("54.1.2.3".to_string());
        let tasks = vec![t];

        assert_eq!(backend_addrs(&tasks, "web", 80, false), vec!["10.0.0.1:32768"]);
        assert_eq!(backend_addrs(&tasks, "web", 80, true), vec!["54.1.2.3:32768"]);
    }

    #[test]
    fn tasks_without_requested_ip_skipped() {
        // Task has a private address only; asking for public skips it
        let tasks = vec![
            task("t1", "10.0.0.1", "web", vec![binding(80, 32768)]),
        ];

        assert!(backend_addrs(&tasks, "web", 80, true).is_empty());
    }

    #[test]
    fn snapshot_build_maps_ports_to_backends() {
        let tasks = vec![
            task("t1", "10.0.0.1", "web", vec![binding(80, 32768), binding(8080, 32769)]),
            task("t2", "10.0.0.2", "web", vec![binding(80, 32770)]),
        ];

        let snapshot = Snapshot::build(&tasks, "web", false);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.backends(80),
            Some(&vec!["10.0.0.1:32768".to_string(), "10.0.0.2:32770".to_string()])
        );
        assert_eq!(snapshot.backends(8080), Some(&vec!["10.0.0.1:32769".to_string()]));
    }

    #[test]
    fn snapshot_keeps_port_with_no_resolvable_backends() {
        // Port is exposed but the task has no private address; the port
        // stays in the snapshot with an empty backend list.
        let mut t = task("t1", "10.0.0.1", "web", vec![binding(80, 32768)]);
        t.private_ip = None;
        let snapshot = Snapshot::build(&[t], "web", false);

        assert!(snapshot.contains_port(80));
        assert_eq!(snapshot.backends(80), Some(&Vec::new()));
    }
}
