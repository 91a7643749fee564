//! Route and broadcast handler registry.
//!
//! Handlers are registered with explicit request/response types; the
//! registry stores them type-erased over encoded payloads so the dispatcher
//! can call them straight from an envelope.

use super::envelope::{decode, encode};
use crate::error::{Error, Result};
use crate::runtime::Async;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Type-erased route handler: encoded request in, encoded response out.
pub type RawRouteHandler = Arc<dyn Fn(Vec<u8>) -> Async<Vec<u8>> + Send + Sync>;

/// Type-erased broadcast handler.
pub type RawBroadcastHandler = Arc<dyn Fn(Vec<u8>) -> Async<()> + Send + Sync>;

/// Registry of the handlers a node serves.
///
/// One handler per key and kind; registering a key twice is an error until
/// it is deregistered. Lookups take a read lock only.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: RwLock<HashMap<String, RawRouteHandler>>,
    broadcasts: RwLock<HashMap<String, RawBroadcastHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route handler for `key`.
    ///
    /// ```rust,ignore
    /// registry.register_route::<GetUser, User, _>("user.get", |req| load_user(req.id))?;
    /// ```
    pub fn register_route<Req, Resp, H>(&self, key: impl Into<String>, handler: H) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Clone + Send + Sync + 'static,
        H: Fn(Req) -> Async<Resp> + Send + Sync + 'static,
    {
        let key = key.into();
        let raw: RawRouteHandler = Arc::new(move |payload: Vec<u8>| {
            let request = match decode::<Req>(&payload) {
                Ok(request) => request,
                Err(e) => return Async::rejected(e),
            };
            let response = handler(request);
            Async::coroutine(async move {
                let response = response.await?;
                Ok(encode(&response)?)
            })
        });

        let mut routes = self.routes.write();
        if routes.contains_key(&key) {
            return Err(Error::HandlerAlreadyRegistered(key));
        }
        info!(key = %key, "registered route handler");
        routes.insert(key, raw);
        Ok(())
    }

    /// Remove the route handler for `key`.
    pub fn deregister_route(&self, key: &str) -> Result<()> {
        match self.routes.write().remove(key) {
            Some(_) => {
                debug!(key, "deregistered route handler");
                Ok(())
            }
            None => Err(Error::HandlerNotFound(key.to_string())),
        }
    }

    /// Register a broadcast handler for `key`.
    pub fn register_broadcast<Msg, H>(&self, key: impl Into<String>, handler: H) -> Result<()>
    where
        Msg: DeserializeOwned + Send + 'static,
        H: Fn(Msg) -> Async<()> + Send + Sync + 'static,
    {
        let key = key.into();
        let raw: RawBroadcastHandler = Arc::new(move |payload: Vec<u8>| match decode::<Msg>(&payload) {
            Ok(message) => handler(message),
            Err(e) => Async::rejected(e),
        });

        let mut broadcasts = self.broadcasts.write();
        if broadcasts.contains_key(&key) {
            return Err(Error::HandlerAlreadyRegistered(key));
        }
        info!(key = %key, "registered broadcast handler");
        broadcasts.insert(key, raw);
        Ok(())
    }

    /// Remove the broadcast handler for `key`.
    pub fn deregister_broadcast(&self, key: &str) -> Result<()> {
        match self.broadcasts.write().remove(key) {
            Some(_) => {
                debug!(key, "deregistered broadcast handler");
                Ok(())
            }
            None => Err(Error::HandlerNotFound(key.to_string())),
        }
    }

    pub fn route_handler(&self, key: &str) -> Option<RawRouteHandler> {
        self.routes.read().get(key).cloned()
    }

    pub fn broadcast_handler(&self, key: &str) -> Option<RawBroadcastHandler> {
        self.broadcasts.read().get(key).cloned()
    }

    /// Registered route keys, sorted.
    pub fn route_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.routes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registered broadcast keys, sorted.
    pub fn broadcast_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.broadcasts.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.route_keys())
            .field("broadcasts", &self.broadcast_keys())
            .finish()
    }
}
