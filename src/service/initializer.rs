use futures::{StreamExt, stream};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::broker::BrokerSession;
use crate::config::{Config, EngineInstanceConfig, InstanceConfig, SettingsLayer};
use crate::engine::{Database, Engine};
use crate::error::{ConfigError, VaultdumpError};
use crate::types::{InstanceFailure, Stage};

/// Concurrent broker reads while resolving instances.
const BROKER_CONCURRENCY: usize = 8;

/// Output of [`initialize_databases`]: adapters ready to run plus the
/// instances that could not be constructed.
#[derive(Debug, Default)]
pub struct Initialized {
    pub databases: Vec<Database>,
    pub failures: Vec<InstanceFailure>,
}

struct Planned<'a> {
    engine: Engine,
    instance: &'a InstanceConfig,
}

/// Resolve every instance of every enabled engine and lease its credential.
///
/// Per-instance problems (bad settings, duplicate keys, lease failures) end up
/// in [`Initialized::failures`] and never stop sibling instances. Lease and KV
/// failures of instances with a known directory carry it, so the run still
/// leaves a failed record there.
pub async fn initialize_databases(config: &Config, session: &BrokerSession) -> Initialized {
    let planned: Vec<Planned<'_>> = Engine::ALL
        .into_iter()
        .filter(|engine| {
            let enabled = config.group(*engine).enabled;
            if !enabled {
                debug!(engine = %engine, "engine disabled; skipping");
            }
            enabled
        })
        .flat_map(move |engine| {
            config
                .group(engine)
                .instances
                .iter()
                .map(move |instance| Planned { engine, instance })
        })
        .collect();

    // Order is preserved so the first of two clashing instances wins.
    let resolved: Vec<_> = stream::iter(planned)
        .map(move |p| async move {
            let result = resolve_instance(config, session, p.engine, p.instance).await;
            (p, result)
        })
        .buffered(BROKER_CONCURRENCY)
        .collect()
        .await;

    let mut out = Initialized::default();
    let mut seen = HashSet::new();
    let mut ready = Vec::new();
    for (p, result) in resolved {
        match result {
            Ok(resolved) => {
                if !seen.insert((resolved.engine, resolved.database.clone())) {
                    let database = resolved.database.clone();
                    out.failures.push(InstanceFailure {
                        engine: p.engine,
                        name: p.instance.name.clone(),
                        database: Some(database.clone()),
                        // The first instance owns this directory.
                        metadata_dir: None,
                        stage: Stage::Initialize,
                        error: ConfigError::DuplicateInstance {
                            engine: p.engine,
                            database,
                        }
                        .into(),
                    });
                    continue;
                }
                ready.push(resolved);
            }
            Err(error) => {
                let owned = matches!(error, VaultdumpError::Credential(_))
                    .then(|| configured_target(config, p.engine, p.instance))
                    .flatten()
                    .filter(|target| seen.insert((target.engine, target.database.clone())));
                let (database, metadata_dir) = match owned {
                    Some(target) => (Some(target.database.clone()), Some(target.instance_dir())),
                    None => (p.instance.overrides.database.clone(), None),
                };
                out.failures.push(InstanceFailure {
                    engine: p.engine,
                    name: p.instance.name.clone(),
                    database,
                    metadata_dir,
                    stage: Stage::Initialize,
                    error,
                });
            }
        }
    }

    let leased: Vec<_> = stream::iter(ready)
        .map(move |resolved| async move {
            let role_path = format!(
                "{}/{}",
                config.group(resolved.engine).creds_path.trim_end_matches('/'),
                resolved.role_name
            );
            let lease = session.lease_dynamic_credential(&role_path).await;
            (resolved, lease)
        })
        .buffered(BROKER_CONCURRENCY)
        .collect()
        .await;

    for (resolved, lease) in leased {
        match lease {
            Ok(credential) => {
                if !credential.ttl.is_zero() && resolved.timeout > credential.ttl {
                    warn!(
                        engine = %resolved.engine,
                        database = %resolved.database,
                        timeout_secs = resolved.timeout.as_secs(),
                        ttl_secs = credential.ttl.as_secs(),
                        "instance timeout exceeds credential lease; long runs may outlive it"
                    );
                }
                let tools = resolved.engine.tools(&config.group(resolved.engine).tools);
                out.databases.push(Database::new(resolved, tools, credential));
            }
            Err(e) => {
                warn!(
                    engine = %resolved.engine,
                    database = %resolved.database,
                    error = %e,
                    "credential lease failed"
                );
                out.failures.push(InstanceFailure {
                    engine: resolved.engine,
                    metadata_dir: Some(resolved.instance_dir()),
                    database: Some(resolved.database),
                    name: resolved.name,
                    stage: Stage::Initialize,
                    error: e.into(),
                });
            }
        }
    }

    info!(
        ready = out.databases.len(),
        failed = out.failures.len(),
        "databases initialized"
    );
    out
}

/// Merge configured layers with KV connection facts, when the instance has a
/// `kv_path`. Facts rank above every configured layer.
async fn resolve_instance(
    config: &Config,
    session: &BrokerSession,
    engine: Engine,
    instance: &InstanceConfig,
) -> Result<EngineInstanceConfig, VaultdumpError> {
    let mut layers = config.layers_for(engine, instance);
    if let Some(kv_path) = instance.kv_path.as_deref() {
        let facts = session.read_connection_facts(kv_path).await?;
        debug!(engine = %engine, instance = %instance.name, kv_path, "connection facts loaded");
        layers.push(SettingsLayer::from(facts));
    }
    Ok(EngineInstanceConfig::resolve(engine, &instance.name, layers)?)
}

/// Settings from configuration alone, used to place the failure record of an
/// instance whose KV facts could not be read. Only instances that name their
/// database explicitly qualify.
fn configured_target(
    config: &Config,
    engine: Engine,
    instance: &InstanceConfig,
) -> Option<EngineInstanceConfig> {
    let layers = config.layers_for(engine, instance);
    if layers.iter().all(|layer| layer.database.is_none()) {
        return None;
    }
    EngineInstanceConfig::resolve(engine, &instance.name, layers).ok()
}
