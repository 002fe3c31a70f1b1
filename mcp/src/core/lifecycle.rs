//! Session lifecycle management.
//!
//! [`SessionManager`] owns every live [`ServerRegistration`]. It performs
//! timeout-bounded registration, installs discovered capabilities into the
//! [`CapabilityRegistry`] and [`MessageRouter`] as one update, and tears
//! sessions down again on unregistration or shutdown.
//!
//! Lock order is manager state, then router, then registry. Nothing acquires
//! the manager state while holding either of the others.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::ServerDescriptor,
    handler::RefreshRequest,
    metrics::{HostMetrics, RegistrationOutcome},
    session::{discover_inventory, Connector, TransportSession},
};
use crate::{
    error::{McpError, McpResult},
    inventory::{CapabilityRegistry, RegistryCounts},
    routing::MessageRouter,
};

/// Capacity of the list-changed notification queue.
const REFRESH_CHANNEL_CAPACITY: usize = 64;

/// A registered server and its live session.
pub struct ServerRegistration {
    descriptor: ServerDescriptor,
    session: Arc<dyn TransportSession>,
    // Calls hold it shared; close takes it exclusively to drain them
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl ServerRegistration {
    fn new(descriptor: ServerDescriptor, session: Arc<dyn TransportSession>) -> Self {
        Self {
            descriptor,
            session,
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow the session for one operation. Fails with `ServerNotFound` once
    /// the registration has started closing.
    pub async fn acquire(&self) -> McpResult<SessionLease<'_>> {
        let guard = self.gate.read().await;
        if self.is_closed() {
            return Err(McpError::ServerNotFound(self.id().to_string()));
        }
        Ok(SessionLease {
            _guard: guard,
            session: self.session.as_ref(),
        })
    }

    /// Stop new calls, wait for in-flight ones, then close the transport.
    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _drained = self.gate.write().await;
        self.session.close().await
    }
}

impl fmt::Debug for ServerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistration")
            .field("descriptor", &self.descriptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A session borrowed for the duration of one call.
pub struct SessionLease<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    session: &'a (dyn TransportSession + 'static),
}

impl Deref for SessionLease<'_> {
    type Target = dyn TransportSession + 'static;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

/// Public view of a registered server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub transport: &'static str,
    pub capabilities: Vec<String>,
    pub weight: f64,
    pub tools: usize,
    pub prompts: usize,
}

#[derive(Default)]
struct ManagerState {
    /// Ids whose registration is in flight
    pending: HashSet<String>,
    servers: HashMap<String, Arc<ServerRegistration>>,
}

pub struct SessionManager {
    state: Arc<Mutex<ManagerState>>,
    registry: Arc<CapabilityRegistry>,
    router: Arc<MessageRouter>,
    connector: Arc<dyn Connector>,
    metrics: Arc<HostMetrics>,
    registration_timeout: Duration,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    shutdown_token: CancellationToken,
}

impl SessionManager {
    /// Create a manager. When called inside a Tokio runtime a background task
    /// is started that re-discovers servers announcing list changes.
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<CapabilityRegistry>,
        router: Arc<MessageRouter>,
        metrics: Arc<HostMetrics>,
        registration_timeout: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(ManagerState::default()));
        let shutdown_token = CancellationToken::new();

        let refresh_tx = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
                handle.spawn(run_refresh_handler(
                    rx,
                    shutdown_token.clone(),
                    Arc::clone(&state),
                    Arc::clone(&registry),
                    Arc::clone(&router),
                ));
                Some(tx)
            }
            Err(_) => {
                warn!("No Tokio runtime; inventory refresh on list changes is disabled");
                None
            }
        };

        Self {
            state,
            registry,
            router,
            connector,
            metrics,
            registration_timeout,
            refresh_tx,
            shutdown_token,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<HostMetrics> {
        &self.metrics
    }

    /// Connect, discover and install one server.
    ///
    /// Rejected without I/O when the descriptor is invalid or the id is
    /// already registered (or being registered). Handshake and discovery
    /// together are bounded by the registration timeout; on timeout or error
    /// any partially opened session is closed and nothing is installed.
    pub async fn register(&self, descriptor: ServerDescriptor) -> McpResult<()> {
        if let Err(e) = descriptor.validate() {
            self.metrics.record_registration(RegistrationOutcome::Failure);
            return Err(e.into());
        }
        let server_id = descriptor.id.clone();

        {
            let mut state = self.state.lock();
            if state.servers.contains_key(&server_id) || !state.pending.insert(server_id.clone())
            {
                drop(state);
                self.metrics
                    .record_registration(RegistrationOutcome::Duplicate);
                warn!(server_id = %server_id, "Rejected duplicate registration");
                return Err(McpError::DuplicateRegistration(server_id));
            }
        }
        let _pending = scopeguard::guard(
            (Arc::clone(&self.state), server_id.clone()),
            |(state, id)| {
                state.lock().pending.remove(&id);
            },
        );

        let timeout = descriptor
            .registration_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.registration_timeout);

        // Holds the session as soon as it exists so a timeout can close it
        let opened: Mutex<Option<Arc<dyn TransportSession>>> = Mutex::new(None);
        let attempt = async {
            let session = self
                .connector
                .connect(&descriptor, self.refresh_tx.clone())
                .await?;
            *opened.lock() = Some(Arc::clone(&session));
            let inventory = discover_inventory(session.as_ref(), &descriptor).await?;
            Ok::<_, McpError>((session, inventory))
        };

        let (session, inventory) = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                let partial = opened.lock().take();
                release_partial(&server_id, partial).await;
                self.metrics.record_registration(RegistrationOutcome::Failure);
                warn!(server_id = %server_id, error = %e, "Registration failed");
                return Err(e);
            }
            Err(_) => {
                let partial = opened.lock().take();
                release_partial(&server_id, partial).await;
                self.metrics.record_registration(RegistrationOutcome::Timeout);
                warn!(server_id = %server_id, ?timeout, "Registration timed out");
                return Err(McpError::RegistrationTimeout { server_id, timeout });
            }
        };

        let tool_names = inventory.tool_names();
        let prompt_names = inventory.prompt_names();
        let registration = Arc::new(ServerRegistration::new(descriptor, Arc::clone(&session)));

        let installed = {
            let mut state = self.state.lock();
            state
                .servers
                .insert(server_id.clone(), Arc::clone(&registration));
            let routed = self
                .router
                .register_server(
                    &server_id,
                    registration.descriptor.capabilities.iter().cloned(),
                    registration.descriptor.weight,
                )
                .and_then(|()| self.router.add_routes(&server_id, &tool_names, &prompt_names));
            match routed {
                Ok(()) => Ok(self.registry.install_server(&server_id, inventory)),
                Err(e) => {
                    self.router.remove_server(&server_id);
                    state.servers.remove(&server_id);
                    Err(e)
                }
            }
        };

        match installed {
            Ok(counts) => {
                self.metrics.record_registration(RegistrationOutcome::Success);
                info!(
                    server_id = %server_id,
                    tools = counts.tools,
                    prompts = counts.prompts,
                    resources = counts.resources,
                    "Registered server"
                );
                Ok(())
            }
            Err(e) => {
                release_partial(&server_id, Some(session)).await;
                self.metrics.record_registration(RegistrationOutcome::Failure);
                Err(e)
            }
        }
    }

    /// Register many servers concurrently. Outcomes are returned in input order.
    pub async fn register_all(
        &self,
        descriptors: Vec<ServerDescriptor>,
    ) -> Vec<(String, McpResult<()>)> {
        let attempts = descriptors.into_iter().map(|descriptor| async move {
            let id = descriptor.id.clone();
            (id, self.register(descriptor).await)
        });
        join_all(attempts).await
    }

    /// Remove a server's routes and descriptors, then close its session after
    /// in-flight calls finish. Every step is attempted even if another fails.
    pub async fn unregister(&self, server_id: &str) -> McpResult<()> {
        let registration = {
            let mut state = self.state.lock();
            let Some(registration) = state.servers.get(server_id).cloned() else {
                return Err(McpError::ServerNotFound(server_id.to_string()));
            };
            if self.registry.remove_server(server_id).is_none() {
                warn!(server_id = %server_id, "Server had no registry entry");
            }
            if !self.router.remove_server(server_id) {
                warn!(server_id = %server_id, "Server had no routes");
            }
            state.servers.remove(server_id);
            registration
        };
        self.metrics.record_unregistration();

        registration.close().await.map_err(|e| {
            warn!(server_id = %server_id, error = %e, "Failed to close session");
            e
        })?;
        info!(server_id = %server_id, "Unregistered server");
        Ok(())
    }

    /// Unregister every server. Individual failures are logged and do not
    /// stop the others. Returns the number of servers that failed to close.
    pub async fn shutdown_all(&self) -> usize {
        self.shutdown_token.cancel();

        let ids = self.server_ids();
        info!(count = ids.len(), "Shutting down all servers");
        let results = join_all(ids.iter().map(|id| self.unregister(id))).await;

        let mut failures = 0;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                warn!(server_id = %id, error = %e, "Shutdown of server failed");
            }
        }
        failures
    }

    /// Re-discover a server now and replace its descriptors wholesale.
    pub async fn refresh(&self, server_id: &str) -> McpResult<RegistryCounts> {
        refresh_inventory(&self.state, &self.registry, &self.router, server_id).await
    }

    pub fn update_weight(&self, server_id: &str, weight: f64) -> McpResult<()> {
        self.router.update_weight(server_id, weight)
    }

    pub fn update_capabilities(&self, server_id: &str, capabilities: Vec<String>) -> McpResult<()> {
        self.router.update_capabilities(server_id, capabilities)
    }

    pub fn registration(&self, server_id: &str) -> Option<Arc<ServerRegistration>> {
        self.state.lock().servers.get(server_id).cloned()
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.state.lock().servers.contains_key(server_id)
    }

    /// Registered server ids, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().servers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn server_info(&self, server_id: &str) -> Option<ServerInfo> {
        let registration = self.registration(server_id)?;
        let descriptor = registration.descriptor();
        Some(ServerInfo {
            id: descriptor.id.clone(),
            transport: descriptor.transport.kind(),
            capabilities: self
                .router
                .server_capabilities(server_id)
                .map(|caps| caps.into_iter().collect())
                .unwrap_or_else(|| descriptor.capabilities.clone()),
            weight: self.router.weight(server_id).unwrap_or(descriptor.weight),
            tools: self.registry.tools_for_server(server_id).len(),
            prompts: self.registry.prompts_for_server(server_id).len(),
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn release_partial(server_id: &str, session: Option<Arc<dyn TransportSession>>) {
    let Some(session) = session else {
        return;
    };
    match session.close().await {
        Ok(()) => debug!(server_id = %server_id, "Released partially opened session"),
        Err(e) => warn!(
            server_id = %server_id,
            error = %e,
            "Failed to release partially opened session"
        ),
    }
}

async fn refresh_inventory(
    state: &Mutex<ManagerState>,
    registry: &CapabilityRegistry,
    router: &MessageRouter,
    server_id: &str,
) -> McpResult<RegistryCounts> {
    let registration = state
        .lock()
        .servers
        .get(server_id)
        .cloned()
        .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;

    let inventory = {
        let session = registration.acquire().await?;
        discover_inventory(&*session, registration.descriptor()).await?
    };
    let tool_names = inventory.tool_names();
    let prompt_names = inventory.prompt_names();

    let state = state.lock();
    let current = state
        .servers
        .get(server_id)
        .is_some_and(|r| Arc::ptr_eq(r, &registration));
    if !current {
        debug!(server_id = %server_id, "Dropping refresh for replaced server");
        return Err(McpError::ServerNotFound(server_id.to_string()));
    }
    router.replace_routes(server_id, &tool_names, &prompt_names)?;
    let counts = registry.install_server(server_id, inventory);
    drop(state);

    info!(
        server_id = %server_id,
        tools = counts.tools,
        prompts = counts.prompts,
        resources = counts.resources,
        "Refreshed server inventory"
    );
    Ok(counts)
}

async fn run_refresh_handler(
    mut rx: mpsc::Receiver<RefreshRequest>,
    token: CancellationToken,
    state: Arc<Mutex<ManagerState>>,
    registry: Arc<CapabilityRegistry>,
    router: Arc<MessageRouter>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Refresh handler shutting down");
                break;
            }
            Some(request) = rx.recv() => {
                debug!(server_id = %request.server_id, "Processing refresh request");
                if let Err(e) =
                    refresh_inventory(&state, &registry, &router, &request.server_id).await
                {
                    warn!(server_id = %request.server_id, error = %e, "Inventory refresh failed");
                }
            }
            else => break,
        }
    }
}
