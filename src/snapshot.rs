//! Versioned configuration snapshots per proxy node
//!
//! A push replaces the node's resources for every kind it names and keeps
//! every other kind. Subscribers are woken on each push; delivering the new
//! snapshot to proxies is the job of whatever discovery transport listens.

use crate::error::{HarnessError, Result};
use crate::ports::PortBlock;
use crate::process::Role;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Kind of a configuration resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Listener,
    Cluster,
    Route,
    Endpoint,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Listener => "listener",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Route => "route",
            ResourceKind::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named resource in its textual form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
    pub body: String,
}

impl Resource {
    /// Parse a textual definition, taking its name from the top-level `name:` key
    pub fn parse(kind: ResourceKind, text: &str) -> Result<Self> {
        let name = text
            .lines()
            .filter(|line| !line.starts_with(char::is_whitespace))
            .map(|line| line.trim_start_matches("- "))
            .find_map(|line| line.strip_prefix("name:"))
            .map(|value| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HarnessError::InvalidResource {
                kind: kind.to_string(),
                reason: "no top-level name".to_string(),
            })?;

        Ok(Self {
            kind,
            name,
            body: text.to_string(),
        })
    }
}

/// Resources of one kind at one version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub version: String,
    pub items: BTreeMap<String, Resource>,
}

impl Resources {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }
}

/// Immutable, kind-partitioned set of resources held for one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    resources: BTreeMap<ResourceKind, Resources>,
}

impl Snapshot {
    pub fn get(&self, kind: ResourceKind) -> Option<&Resources> {
        self.resources.get(&kind)
    }

    /// Version of `kind`, if it was ever pushed
    pub fn version(&self, kind: ResourceKind) -> Option<&str> {
        self.get(kind).map(|r| r.version.as_str())
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.get(kind)
            .map(|r| r.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Current snapshot of every node, with change notification
#[derive(Debug, Default)]
pub struct SnapshotCache {
    nodes: DashMap<String, watch::Sender<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `node`'s resources for each kind in `resources` with `version`.
    ///
    /// Kinds absent from `resources` keep whatever was pushed before. The
    /// version is opaque; callers are responsible for making it increase.
    pub fn push(
        &self,
        node: &str,
        version: &str,
        resources: BTreeMap<ResourceKind, Vec<String>>,
    ) -> Result<Arc<Snapshot>> {
        if node.is_empty() {
            return Err(HarnessError::InvalidResource {
                kind: "snapshot".to_string(),
                reason: "empty node id".to_string(),
            });
        }

        // Parse everything before touching the cache so a bad push changes nothing
        let mut parsed = BTreeMap::new();
        for (kind, texts) in resources {
            let mut items = BTreeMap::new();
            for text in &texts {
                let resource = Resource::parse(kind, text)?;
                if items.contains_key(&resource.name) {
                    return Err(HarnessError::InvalidResource {
                        kind: kind.to_string(),
                        reason: format!("duplicate name {}", resource.name),
                    });
                }
                items.insert(resource.name.clone(), resource);
            }
            parsed.insert(
                kind,
                Resources {
                    version: version.to_string(),
                    items,
                },
            );
        }

        // The entry guard serializes pushes to the same node
        let sender = self
            .nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(Arc::new(Snapshot::default())).0);

        let mut next = Snapshot::clone(&sender.borrow());
        let kinds: Vec<ResourceKind> = parsed.keys().copied().collect();
        next.resources.extend(parsed);
        let next = Arc::new(next);
        sender.send_replace(Arc::clone(&next));

        info!(node, version, ?kinds, "Snapshot pushed");
        Ok(next)
    }

    /// Current snapshot of `node`, if anything was ever pushed for it
    pub fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.nodes.get(node).map(|sender| Arc::clone(&sender.borrow()))
    }

    /// Receiver woken on every push to `node`, starting from its current snapshot
    pub fn subscribe(&self, node: &str) -> watch::Receiver<Arc<Snapshot>> {
        let receiver = self
            .nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(Arc::new(Snapshot::default())).0)
            .subscribe();
        debug!(node, "Snapshot subscriber added");
        receiver
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }
}

/// A listener/cluster push for one node
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub node: String,
    pub version: String,
    pub listeners: Vec<String>,
    pub clusters: Vec<String>,
}

impl Update {
    pub fn new(node: &str, version: &str) -> Self {
        Self {
            node: node.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn listener(mut self, text: impl Into<String>) -> Self {
        self.listeners.push(text.into());
        self
    }

    pub fn cluster(mut self, text: impl Into<String>) -> Self {
        self.clusters.push(text.into());
        self
    }

    /// Push this update. Only non-empty kinds are replaced. An update with no
    /// resources at all for the `client` or `server` node pushes that role's
    /// default listener/cluster pair instead.
    pub fn apply(&self, cache: &SnapshotCache, ports: &PortBlock) -> Result<Arc<Snapshot>> {
        let mut listeners = self.listeners.clone();
        let mut clusters = self.clusters.clone();

        if listeners.is_empty() && clusters.is_empty() {
            let role = match self.node.as_str() {
                "client" => Some(Role::Client),
                "server" => Some(Role::Server),
                _ => None,
            };
            if let Some(role) = role {
                debug!(node = %self.node, "Substituting default resources");
                listeners.push(default_listener(role, ports));
                clusters.push(default_cluster(role, ports));
            }
        }

        let mut resources = BTreeMap::new();
        if !listeners.is_empty() {
            resources.insert(ResourceKind::Listener, listeners);
        }
        if !clusters.is_empty() {
            resources.insert(ResourceKind::Cluster, clusters);
        }
        cache.push(&self.node, &self.version, resources)
    }
}

/// Name of the cluster a role's default listener routes to
pub fn default_cluster_name(role: Role) -> &'static str {
    match role {
        Role::Client => "outbound|9080|http|server.default.svc.cluster.local",
        Role::Server => "inbound|9080|http|server.default.svc.cluster.local",
    }
}

/// Minimal listener: client accepts app traffic, server accepts client proxy traffic
pub fn default_listener(role: Role, ports: &PortBlock) -> String {
    let (name, port) = match role {
        Role::Client => ("client", ports.app_to_client_proxy()),
        Role::Server => ("server", ports.client_to_server_proxy()),
    };
    format!(
        r#"name: {name}
traffic_direction: {direction}
address:
  socket_address:
    address: 127.0.0.1
    port_value: {port}
filter_chains:
- filters:
  - name: envoy.tcp_proxy
    config:
      stat_prefix: {name}
      cluster: "{cluster}"
"#,
        name = name,
        direction = if role == Role::Client { "OUTBOUND" } else { "INBOUND" },
        port = port,
        cluster = default_cluster_name(role),
    )
}

/// Minimal static cluster: client points at the server proxy, server at the backend
pub fn default_cluster(role: Role, ports: &PortBlock) -> String {
    let port = match role {
        Role::Client => ports.client_to_server_proxy(),
        Role::Server => ports.backend(),
    };
    format!(
        r#"name: "{cluster}"
connect_timeout: 1s
type: STATIC
load_assignment:
  cluster_name: "{cluster}"
  endpoints:
  - lb_endpoints:
    - endpoint:
        address:
          socket_address:
            address: 127.0.0.1
            port_value: {port}
"#,
        cluster = default_cluster_name(role),
        port = port,
    )
}
