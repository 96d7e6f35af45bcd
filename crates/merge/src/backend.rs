//! Result-database execution seam.
//!
//! All statements of one user query run on a single MySQL connection guarded
//! by a mutex (the client is not thread-safe per connection); parallelism
//! comes from statements queued on that connection. The trait exists so the
//! merger's concurrency and at-most-once rules are testable without a
//! server.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Pool};
use skyq_common::{CzarConfig, CzarError, MergeFatal, Result};
use tokio::sync::Mutex;
use tonic::async_trait;

/// Executes statements against the result database.
#[async_trait]
pub trait MergeBackend: Send + Sync {
    /// Run one statement, discarding any result set.
    async fn apply(&self, sql: &str) -> Result<()>;

    /// Run `LOAD DATA LOCAL INFILE` into `table`, serving `data` through a
    /// virtual file handle named `virt_file`.
    async fn load_infile(&self, table: &str, virt_file: &str, data: Vec<u8>) -> Result<()>;
}

/// What a failed statement was doing, for fatal-error classification.
#[derive(Debug, Clone, Copy)]
enum SqlContext {
    Create,
    Load,
    Other,
}

fn map_mysql_error(e: mysql_async::Error, table: &str, context: SqlContext) -> CzarError {
    if let mysql_async::Error::Server(server) = &e {
        // ER_RECORD_FILE_FULL: the merge table hit its size limit.
        if server.code == 1114 {
            return MergeFatal::ResultTooLarge(table.to_string()).into();
        }
    }
    match (&e, context) {
        (mysql_async::Error::Io(_), _) | (mysql_async::Error::Driver(_), _) => {
            MergeFatal::ConnectionLost(e.to_string()).into()
        }
        (_, SqlContext::Create) => MergeFatal::CreateTable(e.to_string()).into(),
        (_, SqlContext::Load) => MergeFatal::LoadInfile(e.to_string()).into(),
        (_, SqlContext::Other) => MergeFatal::ConnectionLost(e.to_string()).into(),
    }
}

/// Production backend over one pooled `mysql_async` connection.
pub struct MySqlBackend {
    pool: Pool,
    conn: Mutex<Option<Conn>>,
}

impl MySqlBackend {
    /// Build a backend from the czar result-database configuration.
    pub fn from_config(config: &CzarConfig) -> Result<Self> {
        let mut builder = OptsBuilder::default()
            .user(Some(config.result_user.clone()))
            .db_name(Some(config.result_db.clone()))
            .prefer_socket(true);
        if !config.result_socket.is_empty() {
            builder = builder.socket(Some(config.result_socket.clone()));
        }
        Ok(Self {
            pool: Pool::new(Opts::from(builder)),
            conn: Mutex::new(None),
        })
    }

    async fn with_conn<'a>(
        &self,
        guard: &'a mut Option<Conn>,
    ) -> Result<&'a mut Conn> {
        if guard.is_none() {
            let conn = self
                .pool
                .get_conn()
                .await
                .map_err(|e| CzarError::from(MergeFatal::ConnectionLost(e.to_string())))?;
            *guard = Some(conn);
        }
        Ok(guard.as_mut().expect("connection just installed"))
    }
}

#[async_trait]
impl MergeBackend for MySqlBackend {
    async fn apply(&self, sql: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.with_conn(&mut guard).await?;
        let context = if sql.trim_start().to_ascii_uppercase().starts_with("CREATE") {
            SqlContext::Create
        } else {
            SqlContext::Other
        };
        conn.query_drop(sql)
            .await
            .map_err(|e| map_mysql_error(e, "", context))
    }

    async fn load_infile(&self, table: &str, virt_file: &str, data: Vec<u8>) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.with_conn(&mut guard).await?;
        conn.set_infile_handler(async move {
            Ok(stream::iter(vec![Bytes::from(data)])
                .map(Ok::<_, std::io::Error>)
                .boxed()
                .into())
        });
        let sql = crate::schema::form_load_infile(table, virt_file);
        conn.query_drop(sql)
            .await
            .map_err(|e| map_mysql_error(e, table, SqlContext::Load))
    }
}
