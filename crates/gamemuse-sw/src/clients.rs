//! Application windows the worker can claim, focus, navigate, or open.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gamemuse_common::{GameMuseError, OptionExt, Result};
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

impl ClientType {
    fn accepts(self, other: ClientType) -> bool {
        self == ClientType::All || self == other
    }
}

/// A page or worker the application runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Whether the worker controls this client's fetches.
    pub controlled: bool,
}

impl Client {
    /// A new, uncontrolled, unfocused window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }
}

/// Platform surface for the worker's clients.
#[async_trait]
pub trait ClientHost: Send + Sync {
    /// Clients of the given type, ordered by id.
    async fn match_all(&self, client_type: ClientType) -> Result<Vec<Client>>;

    /// Take control of every open client without waiting for a reload.
    /// Returns how many clients became controlled.
    async fn claim(&self) -> Result<usize>;

    /// Open a new focused window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client>;

    /// Focus a window client.
    async fn focus(&self, id: ClientId) -> Result<Client>;

    /// Navigate a window client to `url`.
    async fn navigate(&self, id: ClientId, url: &Url) -> Result<Client>;
}

/// In-process [`ClientHost`] used by the worker binary and tests.
#[derive(Debug, Default)]
pub struct WindowClients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl WindowClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client opened by the application shell.
    pub async fn add(&self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.write().await.insert(id, client);
        id
    }

    /// Get a client by ID.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Remove a client.
    pub async fn remove(&self, id: ClientId) -> Option<Client> {
        self.clients.write().await.remove(&id)
    }

    fn window_mut(clients: &mut HashMap<ClientId, Client>, id: ClientId) -> Result<&mut Client> {
        let client = clients
            .get_mut(&id)
            .ok_or_not_found(format!("client {}", id.raw()))?;
        if client.client_type != ClientType::Window {
            return Err(GameMuseError::client(format!(
                "client {} is not a window",
                id.raw()
            )));
        }
        Ok(client)
    }
}

#[async_trait]
impl ClientHost for WindowClients {
    async fn match_all(&self, client_type: ClientType) -> Result<Vec<Client>> {
        let clients = self.clients.read().await;
        let mut matched: Vec<Client> = clients
            .values()
            .filter(|c| client_type.accepts(c.client_type))
            .cloned()
            .collect();
        matched.sort_by_key(|c| c.id);
        Ok(matched)
    }

    async fn claim(&self) -> Result<usize> {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        debug!(claimed, "Claimed clients");
        Ok(claimed)
    }

    async fn open_window(&self, url: &Url) -> Result<Client> {
        let mut clients = self.clients.write().await;
        for other in clients.values_mut() {
            other.focused = false;
        }
        let client = Client {
            focused: true,
            controlled: true,
            ..Client::window(url.clone())
        };
        clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn focus(&self, id: ClientId) -> Result<Client> {
        let mut clients = self.clients.write().await;
        Self::window_mut(&mut clients, id)?;
        for client in clients.values_mut() {
            client.focused = client.id == id;
        }
        Self::window_mut(&mut clients, id).map(|c| c.clone())
    }

    async fn navigate(&self, id: ClientId, url: &Url) -> Result<Client> {
        let mut clients = self.clients.write().await;
        let client = Self::window_mut(&mut clients, id)?;
        client.url = url.clone();
        Ok(client.clone())
    }
}
