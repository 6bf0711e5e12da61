//! The runtime aggregate: explicit construction and wiring of every
//! subsystem, replacing the module-global singletons of a scripted runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backend::BackendClient;
use crate::bridge::{NotificationBridge, operation_allowed, parse_notification_payload};
use crate::config::Config;
use crate::events::{EventBinding, EventBus};
use crate::function::{FunctionRecord, Trigger};
use crate::handler::{ExecutionIds, FunctionRequest, materialize_shim};
use crate::harness::{ExecutionOutcome, Harness};
use crate::loader::Loader;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

pub struct Runtime {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub events: EventBus,
    pub backend: BackendClient,
    pub bridge: Option<Arc<NotificationBridge>>,
    harness: Harness,
    loader: Loader,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("functions", &self.registry.len())
            .field("bridge", &self.bridge.is_some())
            .finish()
    }
}

impl Runtime {
    /// Build the runtime and spawn the database bridge tasks when Postgres is
    /// configured. Must run inside a tokio runtime.
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        config.ensure_directories()?;
        let shim_path = materialize_shim(&config.cache_dir)?;

        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let backend = BackendClient::new(&config.backend_url, &config.api_key);
        let harness = Harness::new(registry.clone(), backend.clone(), config.function_timeout);
        let loader = Loader::new(&config, shim_path);

        let mut bridge_parts = None;
        if let Some(pg) = &config.postgres {
            match NotificationBridge::connect(pg).await {
                Ok(parts) => bridge_parts = Some(parts),
                Err(e) => warn!("Database bridge disabled: {}", e),
            }
        } else {
            info!("POSTGRES_HOST not set; database bridge disabled");
        }

        let runtime = Arc::new(Self {
            config,
            registry,
            events: EventBus::new(),
            backend,
            bridge: bridge_parts.as_ref().map(|(bridge, _)| bridge.clone()),
            harness,
            loader,
        });

        if let Some((bridge, cmd_rx)) = bridge_parts {
            let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
            tokio::spawn(bridge.listen_loop(cmd_rx, notify_tx));

            let dispatcher = runtime.clone();
            tokio::spawn(async move {
                while let Some((channel, payload)) = notify_rx.recv().await {
                    dispatcher
                        .dispatch_database_notification(&channel, &payload)
                        .await;
                }
            });
        }

        Ok(runtime)
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Run one invocation under the harness.
    pub async fn execute(
        &self,
        record: &Arc<FunctionRecord>,
        request: FunctionRequest,
        ids: ExecutionIds,
        env_override: Option<HashMap<String, String>>,
    ) -> ExecutionOutcome {
        self.harness.execute(record, request, ids, env_override).await
    }

    /// Start the cron scheduler loop.
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let scheduler = Arc::new(Scheduler::new(self.registry.clone(), self.harness.clone()));
        tokio::spawn(scheduler.run());
    }

    /// Rescan the functions directory and rebuild all derived state. Returns
    /// the number of registered functions.
    pub async fn scan_and_reload(self: &Arc<Self>) -> usize {
        info!(
            "Reloading functions from {}",
            self.loader.functions_dir().display()
        );

        let records = self.loader.load_all(&self.registry).await;
        let mut map = HashMap::new();
        for record in records {
            map.insert(record.name.clone(), Arc::new(record));
        }
        self.registry.replace_all(map);

        self.rebind_events();
        self.ensure_database_listeners().await;

        let count = self.registry.len();
        info!("Registry now holds {} function(s)", count);

        let bootstrapper = self.clone();
        tokio::spawn(async move {
            bootstrapper.bootstrap_run_once().await;
        });

        count
    }

    /// Rebuild the event binding table from the registry. Every reload
    /// replaces an event's bindings wholesale, so repeated reloads never
    /// multiply deliveries.
    pub fn rebind_events(&self) {
        let mut table: HashMap<String, Vec<EventBinding>> = HashMap::new();
        for record in self.registry.snapshot() {
            for trigger in &record.triggers {
                if let Trigger::Event { event } = trigger {
                    table.entry(event.clone()).or_default().push(EventBinding {
                        function: record.name.clone(),
                    });
                }
            }
        }
        self.events.rebuild(table);
    }

    /// Make sure every database trigger has its channel LISTENed on and its
    /// notify trigger installed.
    pub async fn ensure_database_listeners(&self) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        for record in self.registry.snapshot() {
            for trigger in &record.triggers {
                let Trigger::Database { table, .. } = trigger else {
                    continue;
                };
                let Some(channel) = trigger.database_channel() else {
                    continue;
                };
                if let Err(e) = bridge.ensure_channel(&channel) {
                    warn!("Skipping channel for '{}': {}", record.name, e);
                    continue;
                }
                if !table.is_empty()
                    && let Err(e) = bridge.ensure_table_trigger(table, &channel).await
                {
                    warn!("Skipping trigger install for '{}': {}", record.name, e);
                }
            }
        }
    }

    /// Run every pending run-once function, sequentially. Failures leave the
    /// function eligible for the next rescan.
    pub async fn bootstrap_run_once(&self) {
        let pending: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|record| {
                record.run_once
                    && !self.registry.is_completed(&record.name)
                    && !record.status_snapshot().has_completed
            })
            .collect();

        for record in pending {
            info!("Bootstrapping run-once function '{}'", record.name);
            let request = FunctionRequest::synthetic(format!("/{}", record.name), "once");
            self.harness
                .execute(&record, request, ExecutionIds::fresh(), None)
                .await;
        }
    }

    /// Fan a database notification out to every matching function.
    pub async fn dispatch_database_notification(&self, channel: &str, payload_text: &str) {
        let payload = parse_notification_payload(payload_text);

        for record in self.registry.snapshot() {
            if record.run_once && self.registry.is_completed(&record.name) {
                continue;
            }
            for trigger in &record.triggers {
                let Trigger::Database { operations, .. } = trigger else {
                    continue;
                };
                if trigger.database_channel().as_deref() != Some(channel) {
                    continue;
                }
                if !operation_allowed(operations.as_ref(), &payload) {
                    continue;
                }

                let mut request =
                    FunctionRequest::synthetic(format!("/{}", record.name), "database")
                        .with_json_body(&payload);
                request.headers.insert("X-Database-Channel", channel);

                let harness = self.harness.clone();
                let record = record.clone();
                tokio::spawn(async move {
                    harness
                        .execute(&record, request, ExecutionIds::fresh(), None)
                        .await;
                });
                // One invocation per function per notification.
                break;
            }
        }
    }

    /// Publish an event. Returns whether any listeners were bound and how
    /// many deliveries were dispatched.
    pub async fn emit_event(&self, event: &str, data: Value) -> (bool, usize) {
        let bindings = self.events.bindings(event);
        let has_listeners = !bindings.is_empty();

        for binding in &bindings {
            let Some(record) = self.registry.get(&binding.function) else {
                continue;
            };
            let mut request = FunctionRequest::synthetic(format!("/{}", record.name), "event")
                .with_json_body(&data);
            request.headers.insert("X-Event-Name", event);

            let harness = self.harness.clone();
            tokio::spawn(async move {
                harness
                    .execute(&record, request, ExecutionIds::fresh(), None)
                    .await;
            });
        }

        (has_listeners, bindings.len())
    }
}
