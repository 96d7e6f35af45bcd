//! The per-query message table.
//!
//! A row-oriented ledger in the result database carrying client-visible
//! messages. The controller creates and write-locks it at submit time; the
//! client shim blocks on the lock, so unlocking is what releases the client
//! once the result table exists. Messages queue in memory and are written
//! in one batch right before the unlock.

use std::sync::{Arc, Mutex};

use skyq_common::{Result, SessionId};
use tracing::debug;

use skyq_merge::MergeBackend;

/// Message severity recorded for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational progress/completion message.
    Info,
    /// User-visible error.
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        }
    }
}

/// One queued client-visible message.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    /// Session the message belongs to.
    pub session: SessionId,
    /// Severity level.
    pub severity: Severity,
    /// Message code (0 for plain status).
    pub code: i32,
    /// Message text.
    pub message: String,
}

/// Message table bound to one user query.
pub struct MessageTable {
    name: String,
    backend: Arc<dyn MergeBackend>,
    queued: Mutex<Vec<QueryMessage>>,
}

impl MessageTable {
    /// Bind a message table by name.
    pub fn new(name: impl Into<String>, backend: Arc<dyn MergeBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            queued: Mutex::new(Vec::new()),
        }
    }

    /// Table name handed back to the shim.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the table and take the write lock the shim waits on.
    pub async fn lock(&self) -> Result<()> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             session INT NOT NULL,\
             severity VARCHAR(8) NOT NULL,\
             code INT NOT NULL,\
             message TEXT NOT NULL,\
             ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            self.name
        );
        self.backend.apply(&create).await?;
        self.backend
            .apply(&format!("LOCK TABLES {} WRITE", self.name))
            .await
    }

    /// Queue a message for the client; written at unlock time.
    pub fn queue(&self, message: QueryMessage) {
        self.queued.lock().expect("message queue lock").push(message);
    }

    /// Write queued messages and release the lock (which releases the shim).
    pub async fn unlock(&self) -> Result<()> {
        let queued = std::mem::take(&mut *self.queued.lock().expect("message queue lock"));
        debug!(table = %self.name, messages = queued.len(), "saving query messages");
        for m in queued {
            let insert = format!(
                "INSERT INTO {} (session, severity, code, message) \
                 VALUES ({}, '{}', {}, '{}')",
                self.name,
                m.session,
                m.severity.as_str(),
                m.code,
                m.message.replace('\'', "''")
            );
            self.backend.apply(&insert).await?;
        }
        self.backend.apply("UNLOCK TABLES").await
    }
}
