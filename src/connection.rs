use std::sync::Mutex;

use tracing::{debug, warn};

use crate::client::XnatClient;
use crate::error::XnatError;

/// Nesting depth of open connection scopes. The outermost scope opens the
/// session and the last one to close tears it down.
#[derive(Debug, Default)]
pub struct ConnectionScope {
    depth: Mutex<usize>,
}

pub struct ConnectionGuard<'a> {
    scope: &'a ConnectionScope,
    client: &'a dyn XnatClient,
}

impl ConnectionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter<'a>(
        &'a self,
        client: &'a dyn XnatClient,
    ) -> Result<ConnectionGuard<'a>, XnatError> {
        let mut depth = self
            .depth
            .lock()
            .map_err(|_| XnatError::XnatHttp("connection scope lock poisoned".to_string()))?;
        if *depth == 0 {
            client.connect()?;
            debug!("connected to XNAT");
        }
        *depth += 1;
        Ok(ConnectionGuard {
            scope: self,
            client,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.lock().map(|depth| *depth).unwrap_or(0)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut depth) = self.scope.depth.lock() else {
            return;
        };
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            if let Err(err) = self.client.disconnect() {
                warn!(error = %err, "failed to close XNAT session");
            } else {
                debug!("disconnected from XNAT");
            }
        }
    }
}
