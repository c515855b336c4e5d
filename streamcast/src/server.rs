//! Server lifecycle management
//!
//! Owns every stream's rewind buffer and the components around them:
//! - restore on startup (live handoff first, dump file otherwise)
//! - periodic dumps and listener backpressure monitors
//! - handoff server for the next process
//! - orderly shutdown with a final dump

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use streamcast_core::{Config, StreamConfig};
use streamcast_rewind::{BufferRegistry, LoadOutcome, PersistenceManager, RewindBuffer, RewindSettings};

use crate::handoff;

const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Streamcast server - owns the stream registry and its background tasks
pub struct StreamcastServer {
    config: Config,
    registry: Arc<BufferRegistry>,
    persistence: Option<Arc<PersistenceManager>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamcastServer {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(BufferRegistry::new());
        for stream in &config.streams {
            let settings = stream_settings(&config, stream);
            info!(
                stream = %stream.key,
                seconds = settings.seconds,
                burst = settings.burst,
                "Stream configured"
            );
            registry.insert(stream.key.clone(), RewindBuffer::new(stream.key.clone(), settings));
        }
        if registry.is_empty() {
            warn!("No streams configured");
        }

        let persistence = config
            .persistence
            .dir
            .as_ref()
            .filter(|_| config.persistence.enabled)
            .map(|dir| {
                let manager = PersistenceManager::new(dir.clone());
                for entry in registry.iter() {
                    manager.register(Arc::clone(entry.value()));
                }
                Arc::new(manager)
            });

        Self {
            config,
            registry,
            persistence,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    fn buffers(&self) -> Vec<Arc<RewindBuffer>> {
        self.registry.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Fill every buffer with the history the previous process left behind.
    ///
    /// A stream pulled successfully over handoff skips its dump file. Failures
    /// are logged and the stream starts empty.
    pub async fn restore(&self) {
        let timeout = Duration::from_secs(self.config.handoff.timeout_seconds);
        for buffer in self.buffers() {
            if let Some(source) = &self.config.handoff.source {
                match handoff::pull(source, &buffer, timeout).await {
                    Ok(summary) if summary.records > 0 => {
                        info!(
                            stream = %buffer.key(),
                            records = summary.records,
                            inserted = summary.inserted,
                            "Restored from handoff"
                        );
                        continue;
                    }
                    Ok(_) => info!(stream = %buffer.key(), "Handoff source had no history"),
                    Err(e) => warn!(stream = %buffer.key(), "Handoff failed, falling back to disk: {:#}", e),
                }
            }

            let Some(dumper) = self.persistence.as_ref().and_then(|p| p.dumper(buffer.key())) else {
                continue;
            };
            match dumper.try_load().await {
                Ok(LoadOutcome::Loaded(summary)) => {
                    info!(stream = %buffer.key(), records = summary.records, "Restored from disk");
                }
                Ok(LoadOutcome::NoDump) => {}
                Err(e) => error!(stream = %buffer.key(), "Failed to restore buffer, starting empty: {}", e),
            }
        }
    }

    /// Start background tasks and run until a shutdown signal arrives
    pub async fn start(mut self) -> anyhow::Result<()> {
        info!(streams = self.registry.len(), "Starting Streamcast server...");

        self.restore().await;

        if let Some(manager) = &self.persistence {
            if let Some(interval) = self.config.persistence.interval() {
                let manager = Arc::clone(manager);
                let token = self.token.clone();
                self.tasks
                    .push(tokio::spawn(async move { manager.run(interval, token).await }));
            } else {
                info!("Periodic dumps disabled");
            }
        }

        let poll = Duration::from_millis(self.config.rewind.backpressure_poll_ms);
        let max_bytes = self.config.rewind.max_buffered_bytes;
        for buffer in self.buffers() {
            let task = buffer.spawn_backpressure_monitor(poll, max_bytes, self.token.clone());
            self.tasks.push(task);
        }

        if let Some(addr) = &self.config.handoff.listen {
            let listener = TcpListener::bind(addr).await?;
            self.tasks.push(tokio::spawn(handoff::serve(
                listener,
                Arc::clone(&self.registry),
                self.token.clone(),
            )));
        }

        info!("All components started successfully");
        shutdown_signal().await;
        info!("Shutdown signal received, starting graceful shutdown...");

        self.shutdown().await;
        Ok(())
    }

    /// Stop background tasks, write final dumps, close every buffer
    async fn shutdown(self) {
        info!("Shutting down Streamcast server...");
        self.token.cancel();

        for task in self.tasks {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop within {:?}", TASK_DRAIN_TIMEOUT),
            }
        }

        if let Some(manager) = &self.persistence {
            if self.config.persistence.dump_on_shutdown {
                manager.dump_all().await;
            }
        }

        for entry in self.registry.iter() {
            let buffer = entry.value();
            match serde_json::to_string(&buffer.status()) {
                Ok(status) => info!(stream = %buffer.key(), %status, "Final buffer status"),
                Err(e) => warn!(stream = %buffer.key(), "Failed to serialize status: {}", e),
            }
            buffer.close();
        }

        info!("Streamcast server shut down");
    }
}

fn stream_settings(config: &Config, stream: &StreamConfig) -> RewindSettings {
    RewindSettings {
        seconds: stream.seconds(&config.rewind),
        burst: stream.burst(&config.rewind),
        chunk_duration: config.rewind.chunk_duration_ms,
        hls: stream.hls,
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
