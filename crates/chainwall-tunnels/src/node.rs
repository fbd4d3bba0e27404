//! Node manager: turns named node configurations into linked chains.
//!
//! Every node that no other node names as its `next` heads a chain. Chains
//! are built in configuration order; a node that needs another chain (the
//! layer-3 sender's `device`) resolves it by name, which builds that chain
//! first if it does not exist yet. Chain indices are handed out from one
//! counter when a chain is linked, so every chain gets a dense range that no
//! other chain overlaps and lines can cross from one chain into another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chainwall_config::{
    Config, Layer3SenderSettings, LoggerSettings, NodeConfig, TcpListenerSettings,
    TlsServerSettings, node_types,
};
use chainwall_core::{Chain, ChainBuilder, InboundHandler, SocketFilter, Tunnel};
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::layer3_sender::Layer3Sender;
use crate::logger::LoggerTunnel;
use crate::tcp_listener::TcpListenerTunnel;
use crate::tls_server::TlsServerTunnel;

/// Creates the tunnel for one node. The manager is passed along so a node
/// can resolve other nodes by name.
pub type Factory =
    Arc<dyn Fn(&NodeConfig, &mut NodeManager) -> Result<Instance, TunnelError> + Send + Sync>;

/// A freshly created tunnel, plus its socket registration if it accepts
/// connections.
pub struct Instance {
    pub tunnel: Arc<dyn Tunnel>,
    pub acceptor: Option<(SocketFilter, Arc<dyn InboundHandler>)>,
}

impl Instance {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            tunnel,
            acceptor: None,
        }
    }

    /// A tunnel that wants the sockets matching `filter`.
    pub fn accepting<T>(tunnel: Arc<T>, filter: SocketFilter) -> Self
    where
        T: Tunnel + InboundHandler + 'static,
    {
        Self {
            tunnel: tunnel.clone(),
            acceptor: Some((filter, tunnel)),
        }
    }
}

/// Socket registration collected while building.
#[derive(Clone)]
pub struct Acceptor {
    pub node: String,
    pub filter: SocketFilter,
    pub handler: Arc<dyn InboundHandler>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("node", &self.node)
            .field("filter", &self.filter)
            .finish()
    }
}

pub struct NodeManager {
    nodes: Vec<NodeConfig>,
    factories: HashMap<String, Factory>,
    built: HashMap<String, Arc<dyn Tunnel>>,
    building: HashSet<String>,
    chains: Vec<Chain>,
    acceptors: Vec<Acceptor>,
    next_index: usize,
}

impl NodeManager {
    /// A manager over `nodes` that knows the built-in tunnel types.
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        let mut manager = Self {
            nodes,
            factories: HashMap::new(),
            built: HashMap::new(),
            building: HashSet::new(),
            chains: Vec::new(),
            acceptors: Vec::new(),
            next_index: 0,
        };
        manager.register_builtin();
        manager
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.nodes.clone())
    }

    fn register_builtin(&mut self) {
        self.register(node_types::TCP_LISTENER, |node, _| {
            let settings: TcpListenerSettings = node.settings()?;
            let listener = TcpListenerTunnel::new(&settings)?;
            let filter = listener.filter().clone();
            Ok(Instance::accepting(listener, filter))
        });
        self.register(node_types::TLS_SERVER, |node, _| {
            let settings: TlsServerSettings = node.settings()?;
            Ok(Instance::new(TlsServerTunnel::new(&settings)?))
        });
        self.register(node_types::LOGGER, |node, _| {
            let settings: LoggerSettings = node.settings()?;
            Ok(Instance::new(LoggerTunnel::new(&settings)))
        });
        self.register(node_types::LAYER3_SENDER, |node, manager| {
            let settings: Layer3SenderSettings = node.settings()?;
            let device = manager.resolve(&settings.device)?;
            Ok(Instance::new(Layer3Sender::new(settings.device, device)))
        });
    }

    /// Add or replace the factory for a node type.
    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(&NodeConfig, &mut NodeManager) -> Result<Instance, TunnelError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(node_type.to_string(), Arc::new(factory));
    }

    /// Build every chain, heads in configuration order.
    pub fn build_all(&mut self) -> Result<(), TunnelError> {
        let heads: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !self.nodes.iter().any(|o| o.next.as_deref() == Some(n.name.as_str())))
            .map(|n| n.name.clone())
            .collect();
        if heads.is_empty() && !self.nodes.is_empty() {
            return Err(TunnelError::Cycle(self.nodes[0].name.clone()));
        }
        for head in heads {
            self.resolve(&head)?;
        }
        // Lines cross into device chains, so every line spans all indices.
        for chain in &self.chains {
            chain.widen_line_slots(self.next_index);
        }
        info!(
            chains = self.chains.len(),
            tunnels = self.built.len(),
            acceptors = self.acceptors.len(),
            "chains built"
        );
        Ok(())
    }

    /// The tunnel for `name`, building its chain if needed.
    pub fn resolve(&mut self, name: &str) -> Result<Arc<dyn Tunnel>, TunnelError> {
        if let Some(tunnel) = self.built.get(name) {
            return Ok(tunnel.clone());
        }
        if self.building.contains(name) {
            return Err(TunnelError::Cycle(name.to_string()));
        }
        if !self.nodes.iter().any(|n| n.name == name) {
            return Err(TunnelError::UnknownNode(name.to_string()));
        }
        if self.nodes.iter().any(|n| n.next.as_deref() == Some(name)) {
            return Err(TunnelError::Config(format!(
                "node '{name}' is inside another chain and cannot be referenced directly"
            )));
        }
        self.build_chain(name)?;
        self.built
            .get(name)
            .cloned()
            .ok_or_else(|| TunnelError::UnknownNode(name.to_string()))
    }

    fn chain_nodes(&self, head: &str) -> Result<Vec<NodeConfig>, TunnelError> {
        let mut chain: Vec<NodeConfig> = Vec::new();
        let mut cursor = Some(head.to_string());
        while let Some(name) = cursor {
            if chain.iter().any(|n| n.name == name) {
                return Err(TunnelError::Cycle(name));
            }
            let node = self
                .nodes
                .iter()
                .find(|n| n.name == name)
                .cloned()
                .ok_or(TunnelError::UnknownNode(name))?;
            cursor = node.next.clone();
            chain.push(node);
        }
        Ok(chain)
    }

    fn build_chain(&mut self, head: &str) -> Result<(), TunnelError> {
        let nodes = self.chain_nodes(head)?;
        for node in &nodes {
            self.building.insert(node.name.clone());
        }

        let mut tunnels = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let factory = self.factories.get(&node.node_type).cloned().ok_or_else(|| {
                TunnelError::UnknownType {
                    name: node.name.clone(),
                    node_type: node.node_type.clone(),
                }
            })?;
            let instance = factory(node, self)?;
            if let Some((filter, handler)) = instance.acceptor {
                self.acceptors.push(Acceptor {
                    node: node.name.clone(),
                    filter,
                    handler,
                });
            }
            tunnels.push(instance.tunnel);
        }

        // Indices are taken only now: chains resolved by the factories above
        // already claimed theirs.
        let mut builder = ChainBuilder::new(self.next_index);
        for tunnel in &tunnels {
            builder = builder.push(tunnel.clone())?;
        }
        let chain = builder.build()?;
        debug!(
            head,
            base = self.next_index,
            len = chain.len(),
            "chain linked"
        );
        self.next_index = chain.end_index();

        for (node, tunnel) in nodes.iter().zip(tunnels) {
            self.building.remove(&node.name);
            self.built.insert(node.name.clone(), tunnel);
        }
        self.chains.push(chain);
        Ok(())
    }

    /// A built tunnel by node name.
    pub fn instance(&self, name: &str) -> Option<Arc<dyn Tunnel>> {
        self.built.get(name).cloned()
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn acceptors(&self) -> &[Acceptor] {
        &self.acceptors
    }

    /// Number of chain indices handed out so far.
    pub fn index_count(&self) -> usize {
        self.next_index
    }

    /// Run every tunnel's destroy hook, most recently built chain first.
    pub fn destroy(&self) {
        for chain in self.chains.iter().rev() {
            chain.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, node_type: &str, settings: serde_json::Value, next: Option<&str>) -> NodeConfig {
        NodeConfig {
            name: name.into(),
            node_type: node_type.into(),
            settings,
            next: next.map(Into::into),
        }
    }

    fn listener(name: &str, port: u16, next: &str) -> NodeConfig {
        node(
            name,
            node_types::TCP_LISTENER,
            serde_json::json!({ "address": "127.0.0.1", "port": port }),
            Some(next),
        )
    }

    #[test]
    fn single_chain_gets_dense_indices_and_one_acceptor() {
        let mut manager = NodeManager::new(vec![
            listener("in", 8000, "log"),
            node("log", node_types::LOGGER, serde_json::Value::Null, None),
        ]);
        manager.build_all().unwrap();

        assert_eq!(manager.chains().len(), 1);
        assert_eq!(manager.index_count(), 2);
        assert_eq!(manager.instance("in").unwrap().chain_index(), 0);
        assert_eq!(manager.instance("log").unwrap().chain_index(), 1);
        assert_eq!(manager.acceptors().len(), 1);
        assert_eq!(manager.acceptors()[0].node, "in");
        assert_eq!(manager.acceptors()[0].filter.port_min, 8000);
    }

    #[test]
    fn device_chain_is_built_on_demand_without_index_collisions() {
        let mut manager = NodeManager::new(vec![
            listener("in", 8000, "log"),
            node("log", node_types::LOGGER, serde_json::Value::Null, Some("l3")),
            node(
                "l3",
                node_types::LAYER3_SENDER,
                serde_json::json!({ "device": "dev" }),
                None,
            ),
            node("dev", node_types::LOGGER, serde_json::Value::Null, Some("dev-tail")),
            node("dev-tail", node_types::LOGGER, serde_json::Value::Null, None),
        ]);
        manager.build_all().unwrap();

        assert_eq!(manager.chains().len(), 2);
        let mut indices: Vec<usize> = ["in", "log", "l3", "dev", "dev-tail"]
            .iter()
            .map(|n| manager.instance(n).unwrap().chain_index())
            .collect();
        // The device chain was linked first.
        assert_eq!(indices[3], 0);
        assert_eq!(indices[4], 1);
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(manager.index_count(), 5);

        // Lines opened by the listener reach the device chain's slots too.
        for name in ["in", "dev"] {
            assert_eq!(manager.instance(name).unwrap().links().line_slots(), 5);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut manager = NodeManager::new(vec![node("x", "Teleporter", serde_json::Value::Null, None)]);
        let err = manager.build_all().err().unwrap();
        assert!(matches!(err, TunnelError::UnknownType { .. }));
    }

    #[test]
    fn device_cycle_is_rejected() {
        let mut manager = NodeManager::new(vec![
            node(
                "a",
                node_types::LAYER3_SENDER,
                serde_json::json!({ "device": "b" }),
                None,
            ),
            node(
                "b",
                node_types::LAYER3_SENDER,
                serde_json::json!({ "device": "a" }),
                None,
            ),
        ]);
        let err = manager.build_all().err().unwrap();
        assert!(matches!(err, TunnelError::Cycle(_)));
    }

    #[test]
    fn unknown_device_is_rejected() {
        let mut manager = NodeManager::new(vec![node(
            "a",
            node_types::LAYER3_SENDER,
            serde_json::json!({ "device": "nowhere" }),
            None,
        )]);
        let err = manager.build_all().err().unwrap();
        assert!(matches!(err, TunnelError::UnknownNode(ref n) if n == "nowhere"));
    }

    #[test]
    fn device_inside_another_chain_is_rejected() {
        let mut manager = NodeManager::new(vec![
            node("in", node_types::LOGGER, serde_json::Value::Null, Some("mid")),
            node("mid", node_types::LOGGER, serde_json::Value::Null, None),
            node(
                "l3",
                node_types::LAYER3_SENDER,
                serde_json::json!({ "device": "mid" }),
                None,
            ),
        ]);
        let err = manager.build_all().err().unwrap();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn custom_factories_can_be_registered() {
        let mut manager = NodeManager::new(vec![node("x", "Echo", serde_json::Value::Null, None)]);
        manager.register("Echo", |node, _| {
            let settings: LoggerSettings = node.settings()?;
            Ok(Instance::new(LoggerTunnel::new(&settings)))
        });
        manager.build_all().unwrap();
        assert_eq!(manager.instance("x").unwrap().kind(), "Logger");
    }
}
