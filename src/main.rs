use std::{error::Error, sync::Arc, time::Duration};

use pingora::services::{background::background_service, listening::Service};
use pingora_core::{
    listeners::tls::TlsSettings,
    server::{configuration::Opt, Server},
};
use sentry::IntoDsn;

use batchgate::{
    backend::{MemoryQueue, MemoryResultStore, ReqwestClient, StoreJanitor},
    batch::{AsyncSubmitter, BatchExecutor, ResultAggregator, TargetResolver},
    config::{self, Config, Listener},
    core::{status, BatchQueue, HttpClient, ResultStore},
    logging::Logger,
    service::{
        http::{BatchApi, BatchHttpApp},
        status::StatusHttpApp,
    },
    worker::{pool::WorkerPoolService, WorkerPool},
};

const BATCH_SERVICE: &str = "batchgate";
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        None
    };

    if let Err(e) = run(cli_options, config, logger) {
        log::error!("Failed to start batchgate: {e}");
        eprintln!("Failed to start batchgate: {e}");
        std::process::exit(1);
    }
}

fn run(cli_options: Opt, config: Config, logger: Option<Logger>) -> Result<(), Box<dyn Error>> {
    log::info!("Loading target hosts...");
    let targets = config.target_map()?;
    log::info!("{} target host(s) configured", targets.len());
    let resolver = Arc::new(TargetResolver::new(
        targets,
        &config.batch.identity_header,
    )?);

    let client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(config.batch.request_timeout())?);
    let memory_queue = MemoryQueue::new(
        config.queue.topic.clone(),
        config.queue.consumer_group.clone(),
    );
    log::info!(
        "Using in-process queue: [topic: {}] [consumer group: {}]",
        memory_queue.topic(),
        memory_queue.group()
    );
    let queue: Arc<dyn BatchQueue> = Arc::new(memory_queue);
    let memory_store = Arc::new(MemoryResultStore::new());
    let store: Arc<dyn ResultStore> = memory_store.clone();
    let executor = BatchExecutor::new(resolver, client);
    let pool_cfg = config.worker_pool();

    let Config {
        pingora,
        listeners,
        batch,
        store: store_cfg,
        status: status_cfg,
        prometheus: prometheus_cfg,
        sentry: sentry_cfg,
        ..
    } = config;

    let mut server = Server::new_with_opt_and_conf(Some(cli_options), pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    log::info!("Adding batch HTTP service...");
    let api = Arc::new(BatchApi::new(
        executor.clone(),
        AsyncSubmitter::new(queue.clone(), store.clone(), store_cfg.ttl()),
        ResultAggregator::new(store.clone()),
        &batch,
    ));
    let app = BatchHttpApp::new(api, &batch)?;
    let mut http_service = Service::new(BATCH_SERVICE.to_string(), app);
    add_listeners(&mut http_service, &listeners)?;
    server.add_service(http_service);

    let pool = WorkerPool::new(pool_cfg, queue, store, executor);
    if pool.size() > 0 {
        log::info!("Adding worker pool with {} worker(s)...", pool.size());
        server.add_service(background_service(
            "async batch workers",
            WorkerPoolService::new(pool),
        ));
    } else {
        log::info!("No workers configured, async batches are only queued");
    }

    server.add_service(background_service(
        "result store janitor",
        StoreJanitor::new(memory_store, JANITOR_INTERVAL),
    ));

    add_optional_services(&mut server, sentry_cfg, prometheus_cfg, status_cfg);

    log::info!("Bootstrapping...");
    server.bootstrap();
    status::mark_ready();

    log::info!("Starting Server...");
    server.run_forever();
}

/// Add listeners for the batch service, supporting TCP and TLS
fn add_listeners(
    http_service: &mut Service<BatchHttpApp>,
    listeners: &[Listener],
) -> Result<(), Box<dyn Error>> {
    for list_cfg in listeners {
        let address = list_cfg.address.to_string();
        match &list_cfg.tls {
            Some(tls) => {
                let mut settings = TlsSettings::intermediate(&tls.cert_path, &tls.key_path)?;
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                log::info!("Listening on {address} (tls)");
                http_service.add_tls_with_settings(&address, None, settings);
            }
            None => {
                log::info!("Listening on {address}");
                http_service.add_tcp(&address);
            }
        }
    }
    Ok(())
}

/// Add optional services (Sentry, Prometheus, Status)
fn add_optional_services(
    server: &mut Server,
    sentry_cfg: Option<config::Sentry>,
    prometheus_cfg: Option<config::Prometheus>,
    status_cfg: Option<config::Status>,
) {
    if let Some(sentry_cfg) = sentry_cfg {
        log::info!("Adding Sentry config...");
        match sentry_cfg.dsn.into_dsn() {
            Ok(Some(dsn)) => {
                server.sentry = Some(sentry::ClientOptions {
                    dsn: Some(dsn),
                    ..Default::default()
                });
            }
            Ok(None) => log::warn!("Sentry DSN is empty, Sentry disabled."),
            Err(e) => log::error!("Error parsing Sentry DSN: {e}"),
        }
    }

    if let Some(prometheus_cfg) = prometheus_cfg {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    if let Some(status_cfg) = status_cfg {
        log::info!("Adding Status HTTP...");
        server.add_service(StatusHttpApp::status_http_service(&status_cfg));
    }
}
