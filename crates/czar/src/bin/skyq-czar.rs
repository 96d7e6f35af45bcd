use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use skyq_common::CzarConfig;
use skyq_czar::grpc::CzarControlService;
use skyq_czar::Czar;
use skyq_dispatch::grpc::{CzarControlServer, GrpcChunkTransport, WorkerDirectory};
use skyq_merge::MySqlBackend;
use skyq_metadata::{InMemoryMetaStore, MetadataCache};
use tonic::transport::Server;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or_default(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64_or_default(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn load_meta_store(path: Option<String>) -> Result<InMemoryMetaStore, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(InMemoryMetaStore::load(&p)?),
        None => Ok(InMemoryMetaStore::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = env_or_default("SKYQ_CZAR_BIND", "0.0.0.0:9040");
    let addr: SocketAddr = bind.parse()?;

    let defaults = CzarConfig::default();
    let config = CzarConfig {
        result_db: env_or_default("SKYQ_RESULT_DB", &defaults.result_db),
        result_socket: env_or_default("SKYQ_RESULT_SOCKET", &defaults.result_socket),
        result_user: env_or_default("SKYQ_RESULT_USER", &defaults.result_user),
        max_in_flight_per_query: env_usize_or_default(
            "SKYQ_MAX_IN_FLIGHT_PER_QUERY",
            defaults.max_in_flight_per_query,
        ),
        max_in_flight_global: env_usize_or_default(
            "SKYQ_MAX_IN_FLIGHT_GLOBAL",
            defaults.max_in_flight_global,
        ),
        max_attempts: env_u32_or_default("SKYQ_MAX_ATTEMPTS", defaults.max_attempts),
        job_timeout_ms: env_u64_or_default("SKYQ_JOB_TIMEOUT_MS", defaults.job_timeout_ms),
        retry_backoff_base_ms: env_u64_or_default(
            "SKYQ_RETRY_BACKOFF_BASE_MS",
            defaults.retry_backoff_base_ms,
        ),
        merge_buffer_bytes: env_usize_or_default(
            "SKYQ_MERGE_BUFFER_BYTES",
            defaults.merge_buffer_bytes,
        ),
        spatial_overlap_deg: env_f64_or_default(
            "SKYQ_SPATIAL_OVERLAP_DEG",
            defaults.spatial_overlap_deg,
        ),
    };

    let store = load_meta_store(env::var("SKYQ_CATALOG_PATH").ok())?;
    let metadata = Arc::new(MetadataCache::new(Arc::new(store)));

    let workers: Vec<String> = env_or_default("SKYQ_WORKERS", "http://127.0.0.1:9100")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let transport = Arc::new(GrpcChunkTransport::new(WorkerDirectory::new(workers)));
    let backend = Arc::new(MySqlBackend::from_config(&config)?);

    let czar = Czar::new(config, metadata, transport, backend);
    tracing::info!(bind = %addr, "skyq czar listening");

    Server::builder()
        .add_service(CzarControlServer::new(CzarControlService::new(czar)))
        .serve(addr)
        .await?;
    Ok(())
}
