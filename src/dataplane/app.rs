//! Application-helper registry.
//!
//! A fixed-size hash table of helpers keyed by a fold of the virtual port.
//! Helpers bind to classic-NAT connections only; full-NAT and direct-return
//! connections never carry one.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dataplane::conn::Conn;
use crate::framework::AppHelper;
use crate::{Error, Result};

const APP_TAB_BITS: usize = 4;
const APP_TAB_SIZE: usize = 1 << APP_TAB_BITS;
const APP_TAB_MASK: usize = APP_TAB_SIZE - 1;

fn app_hashkey(port: u16) -> usize {
    ((port >> APP_TAB_BITS) ^ port) as usize & APP_TAB_MASK
}

/// Registry of application helpers for the TCP protocol handler.
#[derive(Default)]
pub struct AppRegistry {
    buckets: Mutex<[Vec<Arc<dyn AppHelper>>; APP_TAB_SIZE]>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper. A helper for the same port may only exist once.
    pub fn register(&self, app: Arc<dyn AppHelper>) -> Result<()> {
        let port = app.port();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = &mut buckets[app_hashkey(port)];

        if bucket.iter().any(|existing| existing.port() == port) {
            return Err(Error::AlreadyExists { port });
        }
        bucket.push(app);
        Ok(())
    }

    /// Remove the helper registered for `port`, if any.
    pub fn unregister(&self, port: u16) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets[app_hashkey(port)].retain(|app| app.port() != port);
    }

    /// Number of registered helpers.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind a helper to a freshly created connection. Only classic-NAT
    /// connections bind; the helper's init callback runs after the bind.
    pub fn conn_bind(&self, conn: &Conn) -> Result<()> {
        if !conn.is_masq() {
            return Ok(());
        }

        let app = {
            let buckets = self.buckets.lock().unwrap();
            buckets[app_hashkey(conn.vport)]
                .iter()
                .find(|app| app.port() == conn.vport)
                .cloned()
        };

        if let Some(app) = app {
            debug!(app = app.name(), port = conn.vport, "binding connection");
            conn.set_app(app.clone());
            app.init_conn(conn)?;
        }
        Ok(())
    }
}
