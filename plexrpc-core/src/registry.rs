//! Capability registry: method routing per transport kind.
//!
//! Controllers are registered once at startup through [`RegistryBuilder`].
//! [`RegistryBuilder::build`] freezes the routing table into an immutable
//! [`CapabilityRegistry`] that is shared behind an `Arc` and read without
//! locking.

use crate::controller::{Controller, ControllerFactory};
use crate::error::{RegistryError, RpcError};
use crate::transport::TransportKind;
use plexrpc_protocol::{NodeAddress, NodeCapabilitySnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identity assigned to a registered controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// One registered controller.
pub struct ControllerDescriptor {
    id: HandlerId,
    service: String,
    method: String,
    transports: BTreeSet<TransportKind>,
    external: bool,
    factory: Arc<dyn ControllerFactory>,
}

impl ControllerDescriptor {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn transports(&self) -> &BTreeSet<TransportKind> {
        &self.transports
    }

    /// Whether the service counts as externally callable.
    pub fn is_external(&self) -> bool {
        self.external || self.transports.iter().any(TransportKind::is_external)
    }

    /// Creates a fresh controller instance for one call.
    pub fn create(&self) -> Box<dyn Controller> {
        self.factory.create()
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("method", &self.method)
            .field("transports", &self.transports)
            .field("external", &self.external)
            .finish()
    }
}

/// Code-side factories that configuration bindings can refer to.
#[derive(Default)]
pub struct ControllerCatalog {
    factories: HashMap<(String, String), Arc<dyn ControllerFactory>>,
}

impl ControllerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, service: &str, method: &str, factory: F) -> &mut Self
    where
        F: ControllerFactory + 'static,
    {
        self.factories
            .insert((service.to_string(), method.to_string()), Arc::new(factory));
        self
    }

    pub fn get(&self, service: &str, method: &str) -> Option<Arc<dyn ControllerFactory>> {
        self.factories
            .get(&(service.to_string(), method.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// A configured exposure of a catalog controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerBinding {
    pub service: String,
    pub method: String,
    pub transports: Vec<TransportKind>,
    /// Advertise the service even when it is only bound to the cluster.
    #[serde(default)]
    pub external: bool,
}

type MethodTable = HashMap<String, HashMap<String, Arc<ControllerDescriptor>>>;

/// Collects registrations before the registry is frozen.
pub struct RegistryBuilder {
    node_address: NodeAddress,
    descriptors: Vec<Arc<ControllerDescriptor>>,
    routes: HashMap<TransportKind, MethodTable>,
    next_id: u64,
}

impl RegistryBuilder {
    pub fn new(node_address: NodeAddress) -> Self {
        Self {
            node_address,
            descriptors: Vec::new(),
            routes: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a controller on the given transport kinds.
    ///
    /// Fails if any `(service, method, kind)` triple is already taken; in
    /// that case nothing is registered.
    pub fn register<F, I>(
        &mut self,
        service: &str,
        method: &str,
        transports: I,
        factory: F,
    ) -> Result<HandlerId, RpcError>
    where
        F: ControllerFactory + 'static,
        I: IntoIterator<Item = TransportKind>,
    {
        self.insert(service, method, transports, false, Arc::new(factory))
    }

    /// Registers a controller whose service is advertised in the node
    /// snapshot even when it is only exposed on the cluster transport.
    pub fn register_external<F, I>(
        &mut self,
        service: &str,
        method: &str,
        transports: I,
        factory: F,
    ) -> Result<HandlerId, RpcError>
    where
        F: ControllerFactory + 'static,
        I: IntoIterator<Item = TransportKind>,
    {
        self.insert(service, method, transports, true, Arc::new(factory))
    }

    /// Registers every binding against the catalog.
    pub fn register_from_config(
        &mut self,
        catalog: &ControllerCatalog,
        bindings: &[ControllerBinding],
    ) -> Result<(), RegistryError> {
        for binding in bindings {
            let factory = catalog.get(&binding.service, &binding.method).ok_or_else(|| {
                RegistryError::UnknownController {
                    service: binding.service.clone(),
                    method: binding.method.clone(),
                }
            })?;
            if binding.transports.is_empty() {
                return Err(RegistryError::NoTransports {
                    service: binding.service.clone(),
                    method: binding.method.clone(),
                });
            }
            self.insert(
                &binding.service,
                &binding.method,
                binding.transports.iter().copied(),
                binding.external,
                factory,
            )?;
        }
        Ok(())
    }

    fn insert<I>(
        &mut self,
        service: &str,
        method: &str,
        transports: I,
        external: bool,
        factory: Arc<dyn ControllerFactory>,
    ) -> Result<HandlerId, RpcError>
    where
        I: IntoIterator<Item = TransportKind>,
    {
        let transports: BTreeSet<TransportKind> = transports.into_iter().collect();

        for kind in &transports {
            let taken = self
                .routes
                .get(kind)
                .and_then(|services| services.get(service))
                .is_some_and(|methods| methods.contains_key(method));
            if taken {
                return Err(RpcError::DuplicateRegistration {
                    service: service.to_string(),
                    method: method.to_string(),
                    transport: kind.to_string(),
                });
            }
        }

        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let descriptor = Arc::new(ControllerDescriptor {
            id,
            service: service.to_string(),
            method: method.to_string(),
            transports: transports.clone(),
            external,
            factory,
        });

        for kind in transports {
            self.routes
                .entry(kind)
                .or_default()
                .entry(service.to_string())
                .or_default()
                .insert(method.to_string(), descriptor.clone());
        }

        tracing::debug!(
            "Registered {}.{} as {} on {:?}",
            service,
            method,
            id,
            descriptor.transports
        );
        self.descriptors.push(descriptor);
        Ok(id)
    }

    /// Freezes the routing table.
    pub fn build(self) -> CapabilityRegistry {
        let external: BTreeSet<String> = self
            .descriptors
            .iter()
            .filter(|d| d.is_external())
            .map(|d| d.service.clone())
            .collect();

        let snapshot = NodeCapabilitySnapshot::new(
            plexrpc_protocol::version_tag(),
            self.node_address.clone(),
            external,
        );

        tracing::info!(
            "Capability registry built: {} controllers, {} external services",
            self.descriptors.len(),
            snapshot.external_services().len()
        );

        CapabilityRegistry {
            node_address: self.node_address,
            descriptors: self.descriptors,
            routes: self.routes,
            snapshot,
        }
    }
}

/// Immutable routing table of a node.
pub struct CapabilityRegistry {
    node_address: NodeAddress,
    descriptors: Vec<Arc<ControllerDescriptor>>,
    routes: HashMap<TransportKind, MethodTable>,
    snapshot: NodeCapabilitySnapshot,
}

impl CapabilityRegistry {
    pub fn builder(node_address: NodeAddress) -> RegistryBuilder {
        RegistryBuilder::new(node_address)
    }

    /// Returns the handler serving `service.method` on `kind`.
    pub fn resolve(
        &self,
        service: &str,
        method: &str,
        kind: TransportKind,
    ) -> Result<&Arc<ControllerDescriptor>, RpcError> {
        self.routes
            .get(&kind)
            .and_then(|services| services.get(service))
            .and_then(|methods| methods.get(method))
            .ok_or_else(|| RpcError::routing_not_found(service, method, kind))
    }

    /// Returns the capability snapshot of this node.
    pub fn snapshot(&self) -> NodeCapabilitySnapshot {
        self.snapshot.clone()
    }

    pub fn node_address(&self) -> &NodeAddress {
        &self.node_address
    }

    /// Lists `(service, method)` pairs servable on `kind`, sorted.
    pub fn routes(&self, kind: TransportKind) -> Vec<(&str, &str)> {
        let mut routes: Vec<(&str, &str)> = self
            .routes
            .get(&kind)
            .map(|services| {
                services
                    .iter()
                    .flat_map(|(service, methods)| {
                        methods.keys().map(move |m| (service.as_str(), m.as_str()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        routes.sort_unstable();
        routes
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ControllerDescriptor>> {
        self.descriptors.iter()
    }

    /// Number of registered controllers.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("node_address", &self.node_address)
            .field("controllers", &self.descriptors.len())
            .finish()
    }
}
