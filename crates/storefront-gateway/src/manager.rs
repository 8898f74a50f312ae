//! Gateway manager
//!
//! [`GatewayManager`] owns the connection registry, the OTP store, the event
//! router and the background OTP sweep. It is built once at process start
//! with [`GatewayManager::start`] and shared as `Arc<GatewayManager>`; there
//! is no global instance. Storage and identity resolution are injected.

use crate::{
    broadcaster::Broadcaster,
    config::GatewayConfig,
    connection::{self, Classification, ConnectionDeps, ConnectionSettings},
    handlers::{ChatDeps, register_chat_handlers},
    identity::IdentityResolver,
    model::{ProductStockDelta, UserId},
    otp::{Otp, OtpError, OtpStore},
    protocol::EventType,
    registry::{BroadcastOutcome, ConnectionId, Registry},
    router::EventRouter,
    store::MessageStore,
};
use axum::{
    extract::ws::Message,
    http::{Extensions, HeaderMap},
};
use futures::{Sink, Stream};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Point-in-time gateway statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub guest_connections: usize,
    pub distinct_users: usize,
    pub pending_otps: usize,
}

/// Real-time gateway
///
/// Construct exactly one per process through [`GatewayManager::start`]. The
/// OTP sweep runs until [`GatewayManager::shutdown`] is called or the
/// manager is dropped.
pub struct GatewayManager {
    config: GatewayConfig,
    registry: Arc<Registry>,
    otps: Arc<OtpStore>,
    broadcaster: Broadcaster,
    identity: Arc<dyn IdentityResolver>,
    deps: Arc<ConnectionDeps>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayManager {
    /// Build the gateway and start the OTP sweep
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: GatewayConfig,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let mut router = EventRouter::new();
        register_chat_handlers(
            &mut router,
            ChatDeps {
                store,
                broadcaster: broadcaster.clone(),
                max_content_length: config.max_content_length,
            },
        );

        let deps = Arc::new(ConnectionDeps {
            registry: Arc::clone(&registry),
            router: Arc::new(router),
            settings: ConnectionSettings::from(&config),
        });

        let otps = Arc::new(OtpStore::new(config.otp_retention));
        let shutdown = CancellationToken::new();
        let sweeper = otps.spawn_sweeper(config.otp_sweep_interval, shutdown.child_token());

        info!(
            pong_wait_ms = config.pong_wait.as_millis() as u64,
            otp_retention_ms = config.otp_retention.as_millis() as u64,
            max_message_size = config.max_message_size,
            "gateway started"
        );

        Arc::new(Self {
            config,
            registry,
            otps,
            broadcaster,
            identity,
            deps,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn otps(&self) -> &Arc<OtpStore> {
        &self.otps
    }

    /// Issue a one-time pass for an authenticated HTTP caller
    pub async fn issue_otp(&self) -> Result<Otp, OtpError> {
        self.otps.issue().await
    }

    /// Resolve the user behind an upgrade request
    pub fn resolve_identity(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<UserId> {
        self.identity.resolve(headers, extensions)
    }

    /// Decide the classification of a new connection
    ///
    /// The OTP, when present, is consumed even if no identity resolves.
    /// Only a valid OTP together with a resolved identity authenticates.
    pub async fn classify(&self, otp: Option<&str>, identity: Option<UserId>) -> Classification {
        let otp_valid = match otp {
            Some(key) => self.otps.validate_and_consume(key).await,
            None => false,
        };

        match (otp_valid, identity) {
            (true, Some(user_id)) => Classification::Authenticated(user_id),
            (false, _) => {
                if otp.is_some() {
                    info!(user_id = ?identity, "rejected OTP, connecting as guest");
                }
                Classification::Guest
            }
            (true, None) => {
                info!("valid OTP without an identity, connecting as guest");
                Classification::Guest
            }
        }
    }

    /// Register an upgraded socket and start its loops
    ///
    /// `sink` and `stream` are the two halves of the socket.
    pub async fn attach<K, S, E>(
        &self,
        sink: K,
        stream: S,
        classification: Classification,
    ) -> ConnectionId
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: fmt::Display + Send,
        S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        connection::open(Arc::clone(&self.deps), classification, sink, stream).await
    }

    /// Send `entity` to every connection, guests included
    pub async fn broadcast_all<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        event_type: EventType,
    ) -> BroadcastOutcome {
        self.broadcaster.broadcast_all(entity, event_type).await
    }

    /// Send `entity` to every connection of the given users
    pub async fn broadcast_to_users<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        user_ids: &[UserId],
        event_type: EventType,
    ) -> BroadcastOutcome {
        self.broadcaster
            .broadcast_to_users(entity, user_ids, event_type)
            .await
    }

    /// Announce stock changes after an order was fulfilled
    pub async fn broadcast_stock_update(&self, deltas: &[ProductStockDelta]) -> BroadcastOutcome {
        self.broadcast_all(deltas, EventType::ProductsStockUpdate)
            .await
    }

    pub async fn stats(&self) -> GatewayStats {
        let registry = self.registry.stats().await;
        let pending_otps = self.otps.len().await;
        GatewayStats {
            total_connections: registry.total_connections,
            authenticated_connections: registry.authenticated_connections,
            guest_connections: registry.guest_connections,
            distinct_users: registry.distinct_users,
            pending_otps,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the OTP sweep and close every live connection
    ///
    /// Returns once the sweep task has exited. Calling it again only closes
    /// connections opened since.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper
            && let Err(e) = sweeper.await
        {
            warn!(error = %e, "OTP sweeper panicked");
        }

        let closed = self.registry.close_all().await;
        info!(closed, "gateway shut down");
    }
}

impl fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayManager")
            .field("config", &self.config)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for GatewayManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
