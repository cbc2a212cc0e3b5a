use crate::capture::{BufferedRecorder, CaptureBuffer};
use crate::config::{Settings, ORIGINAL_BASE_URL_ENV};
use crate::dashboard::{self, DashboardState};
use crate::error::{Error, Result};
use crate::pipeline::sink::{APP_NAME_ENV, RUN_ID_ENV};
use crate::pipeline::{HttpTraceSink, LoggingPipeline, PipelineStats, TraceSink, TracingSink};
use crate::providers::{ProviderConfigFile, ProviderRegistry};
use crate::proxy::headers::DASHBOARD_PREFIX;
use crate::proxy::{serve, ForwardingEngine, ProxyConfig, ProxyService};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Main application struct that coordinates all components
#[derive(Debug, Clone)]
pub struct Application {
    settings: Settings,
    providers: ProviderConfigFile,
}

impl Application {
    pub fn new(settings: Settings, providers: ProviderConfigFile) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            providers,
        })
    }

    /// Load settings and the provider file from the environment
    pub fn from_env() -> Result<Self> {
        let settings = Settings::new()?;
        let providers = ProviderConfigFile::load()?;
        Self::new(settings, providers)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderConfigFile {
        &self.providers
    }

    /// Bind, start the pipeline and accept connections
    ///
    /// Returns once the listener is accepting, which is the readiness signal.
    #[instrument(skip(self))]
    pub async fn start(self) -> Result<RunningProxy> {
        let registry = ProviderRegistry::build(&self.providers)?;
        let provider_names: Vec<String> = registry.names().map(|n| n.to_string()).collect();
        let proxy_config = ProxyConfig::from_settings(&self.settings, &self.providers)?;
        let proxy_all = proxy_config.proxy_all;

        let run_id = std::env::var(RUN_ID_ENV)
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let app_name = std::env::var(APP_NAME_ENV).ok().filter(|n| !n.trim().is_empty());

        let sink = self.sink(&run_id, app_name)?;
        let pipeline = LoggingPipeline::start(sink, (&self.settings.pipeline).into());
        let buffer = Arc::new(CaptureBuffer::new(self.settings.dashboard.buffer_capacity));
        let recorder = Arc::new(BufferedRecorder::new(
            Arc::clone(&buffer),
            Some(Arc::clone(&pipeline)),
        ));

        let dashboard_state =
            DashboardState::new(Arc::clone(&buffer), Some(Arc::clone(&pipeline)), provider_names);
        let engine = ForwardingEngine::new(proxy_config, Arc::new(registry), recorder);
        let service = ProxyService::new(engine, dashboard_state.clone());

        let proxy = &self.settings.proxy;
        let listener = bind_first_free(&proxy.host, proxy.port, proxy.port_search_attempts).await?;
        let local_addr = listener.local_addr()?;
        let grace = self.settings.shutdown_grace();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, service, stopped(shutdown_rx.clone()), grace));

        let dashboard = match self.settings.dashboard.port {
            Some(port) => {
                let listener = TcpListener::bind((proxy.host.as_str(), port)).await?;
                let addr = listener.local_addr()?;
                let router = dashboard::router(dashboard_state);
                let signal = stopped(shutdown_rx);
                let handle = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router)
                        .with_graceful_shutdown(signal)
                        .await
                    {
                        warn!(error = %e, "Dashboard server failed");
                    }
                });
                Some((addr, handle))
            }
            None => None,
        };

        info!(
            addr = %local_addr,
            run_id = %run_id,
            proxy_all,
            sink = pipeline.sink_name(),
            "Proxy ready"
        );

        Ok(RunningProxy {
            local_addr,
            dashboard: dashboard.as_ref().map(|(addr, _)| *addr),
            dashboard_task: dashboard.map(|(_, handle)| handle),
            run_id,
            proxy_all,
            original_base_url: self.settings.proxy.original_base_url.clone(),
            buffer,
            pipeline,
            shutdown_tx,
            server,
            grace,
        })
    }

    /// Debug mode or a missing endpoint logs records locally
    fn sink(&self, run_id: &str, app_name: Option<String>) -> Result<Arc<dyn TraceSink>> {
        if self.providers.debug {
            return Ok(Arc::new(TracingSink));
        }
        match HttpTraceSink::from_settings(&self.settings.sink, run_id, app_name)? {
            Some(sink) => Ok(Arc::new(sink)),
            None => Ok(Arc::new(TracingSink)),
        }
    }
}

/// Resolves once `rx` observes a stop request or its sender is gone
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Bind the first free port in `port..port + attempts`; port 0 picks any
pub async fn bind_first_free(host: &str, port: u16, attempts: u16) -> Result<TcpListener> {
    if port == 0 {
        return Ok(TcpListener::bind((host, 0)).await?);
    }

    let end = u32::from(port) + u32::from(attempts.max(1));
    for candidate in u32::from(port)..end {
        let Ok(candidate) = u16::try_from(candidate) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::NoFreePort { start: port, end })
}

/// A started proxy; dropping it without `shutdown` leaves the tasks running
#[derive(Debug)]
pub struct RunningProxy {
    local_addr: SocketAddr,
    dashboard: Option<SocketAddr>,
    dashboard_task: Option<JoinHandle<()>>,
    run_id: String,
    proxy_all: bool,
    original_base_url: Option<String>,
    buffer: Arc<CaptureBuffer>,
    pipeline: Arc<LoggingPipeline>,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<()>,
    grace: Duration,
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Base URL a child should use instead of its provider's
    pub fn proxy_url(&self) -> String {
        format!("http://{}", reachable(self.local_addr))
    }

    pub fn dashboard_url(&self) -> String {
        match self.dashboard {
            Some(addr) => format!("http://{}{DASHBOARD_PREFIX}", reachable(addr)),
            None => format!("{}{DASHBOARD_PREFIX}", self.proxy_url()),
        }
    }

    pub fn buffer(&self) -> &Arc<CaptureBuffer> {
        &self.buffer
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Variables a launcher injects into the child's environment
    pub fn child_env(&self) -> Vec<(String, String)> {
        let proxy_url = self.proxy_url();
        let mut env = vec![("OPENAI_BASE_URL".to_string(), proxy_url.clone())];
        if let Some(original) = &self.original_base_url {
            env.push((ORIGINAL_BASE_URL_ENV.to_string(), original.clone()));
        }
        env.push((RUN_ID_ENV.to_string(), self.run_id.clone()));

        if self.proxy_all {
            env.push(("HTTP_PROXY".to_string(), proxy_url.clone()));
            env.push(("HTTPS_PROXY".to_string(), proxy_url));
            env.push(("NO_PROXY".to_string(), reachable(self.local_addr).to_string()));
        }
        env
    }

    /// Stop accepting, drain connections and the pipeline within the grace
    /// period
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn shutdown(self) -> PipelineStats {
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.server.await {
            warn!(error = %e, "Proxy server task failed");
        }
        if let Some(mut task) = self.dashboard_task {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                warn!("Dashboard connections still open, aborting");
                task.abort();
            }
        }

        let stats = self.pipeline.shutdown(self.grace).await;
        info!(
            delivered = stats.delivered,
            dropped = stats.dropped,
            discarded = stats.discarded_at_shutdown,
            "Proxy stopped"
        );
        stats
    }
}

/// Wildcard binds are reached through loopback
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.proxy.host = "127.0.0.1".to_string();
        settings.proxy.port = 0;
        settings.pipeline.shutdown_grace_ms = 200;
        settings
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let app = Application::new(settings(), ProviderConfigFile::default()).unwrap();
        let running = app.start().await.unwrap();

        assert_ne!(running.local_addr().port(), 0);
        assert!(running.dashboard_url().ends_with(DASHBOARD_PREFIX));

        let env = running.child_env();
        assert!(env
            .iter()
            .any(|(k, v)| k == "OPENAI_BASE_URL" && *v == running.proxy_url()));
        assert!(env.iter().any(|(k, _)| k == RUN_ID_ENV));
        assert!(!env.iter().any(|(k, _)| k == "HTTP_PROXY"));

        let stats = running.shutdown().await;
        assert_eq!(stats.enqueued, 0);
    }

    #[tokio::test]
    async fn test_proxy_all_exports_proxy_variables() {
        let mut settings = settings();
        settings.proxy.proxy_all = true;
        settings.proxy.original_base_url = Some("http://localhost:8000/v1".to_string());
        let running = Application::new(settings, ProviderConfigFile::default())
            .unwrap()
            .start()
            .await
            .unwrap();

        let env = running.child_env();
        let value = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        assert_eq!(value("HTTPS_PROXY"), Some(running.proxy_url()));
        assert_eq!(value(ORIGINAL_BASE_URL_ENV).as_deref(), Some("http://localhost:8000/v1"));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_port_search_skips_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_first_free("127.0.0.1", port, 20).await {
            Ok(listener) => assert_ne!(listener.local_addr().unwrap().port(), port),
            Err(Error::NoFreePort { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_no_free_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_first_free("127.0.0.1", port, 1).await.unwrap_err();
        assert!(matches!(err, Error::NoFreePort { start, .. } if start == port));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = settings();
        settings.pipeline.workers = 0;
        assert!(Application::new(settings, ProviderConfigFile::default()).is_err());
    }
}
