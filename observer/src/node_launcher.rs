use std::{net::Ipv4Addr, sync::Arc};

use anyhow::Result;
use jsonrpsee::server::ServerHandle;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::*;

use crate::{
    api::{self, ApiContext},
    bridge::{ChainClient, ConsensusBridge, EventSource, KeyValueStore, PeerHost},
    broadcast::BatchBroadcaster,
    cfg::Config,
    chain_observer::ChainObserver,
    crypto::SecretKey,
    engine::AttestationGatherer,
    events::subscribe_events,
    metrics::Metrics,
    networking::AttestationServer,
    sync::{StateSyncServer, StateSynchroniser},
    validators::ActiveValidators,
};

/// The collaborators an [ObserverNode] is launched with.
pub struct Collaborators {
    pub bridge: Arc<dyn ConsensusBridge>,
    pub events: Arc<dyn EventSource>,
    pub host: Arc<dyn PeerHost>,
    pub clients: Vec<Arc<dyn ChainClient>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

/// A running observer: the attestation engine and every task feeding it.
pub struct ObserverNode {
    engine: Arc<AttestationGatherer>,
    observer: Arc<ChainObserver>,
    broadcaster: Arc<BatchBroadcaster>,
    store: Option<Arc<dyn KeyValueStore>>,
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    rpc_handle: Option<ServerHandle>,
}

impl ObserverNode {
    pub async fn launch(
        secret_key: SecretKey,
        config: &Config,
        collaborators: Collaborators,
        metrics: Metrics,
    ) -> Result<Self> {
        let Collaborators {
            bridge,
            events,
            host,
            clients,
            store,
        } = collaborators;
        let (shutdown, shutdown_receiver) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let validators = ActiveValidators::default();
        let broadcaster = Arc::new(BatchBroadcaster::new(
            &config.attestation,
            host.clone(),
            validators.clone(),
            metrics.clone(),
        ));
        let (observer_commands, commands) = mpsc::unbounded_channel();
        let engine = Arc::new(AttestationGatherer::new(
            secret_key,
            config.attestation.clone(),
            bridge.clone(),
            validators,
            broadcaster.clone(),
            observer_commands,
            metrics.clone(),
        ));

        let pub_key = engine.public_key();
        match bridge.node_status(&pub_key).await {
            Ok(status) if status.active => info!(%pub_key, "node is an active validator"),
            Ok(_) => warn!(%pub_key, "node is not an active validator, its attestations will be ignored"),
            Err(e) => warn!(%pub_key, "failed to query node status: {e}"),
        }
        if let Err(e) = engine.refresh_validators().await {
            // The reconcile loop retries.
            warn!("failed to fetch active validators: {e}");
        }

        let attestation_server = Arc::new(AttestationServer::new(
            engine.clone(),
            config.attestation.max_batch_size,
            config.attestation.peer_timeout,
            metrics.clone(),
        ));
        attestation_server.listen(&*host, &mut tasks, shutdown_receiver.clone())?;
        let state_sync_server = Arc::new(StateSyncServer::new(
            engine.clone(),
            config.attestation.max_quorum_txs_per_batch,
            config.attestation.peer_timeout,
        ));
        state_sync_server.listen(&*host, &mut tasks, shutdown_receiver.clone())?;

        let observer = Arc::new(ChainObserver::new(
            engine.clone(),
            bridge,
            clients,
            store.clone(),
            &config.observer,
            metrics,
        ));
        observer
            .start(&mut tasks, commands, shutdown_receiver.clone())
            .await?;

        tasks.spawn(engine.clone().run(shutdown_receiver.clone()));
        tasks.spawn(broadcaster.clone().run(shutdown_receiver.clone()));
        tasks.spawn(StateSynchroniser::new(engine.clone(), host.clone()).run(shutdown_receiver.clone()));
        tasks.spawn(subscribe_events(events, engine.clone(), shutdown_receiver));

        let rpc_handle = match &config.api {
            Some(api_config) => {
                let context = ApiContext {
                    peer_id: host.local_peer_id(),
                    engine: engine.clone(),
                    observer: observer.clone(),
                };
                let server = jsonrpsee::server::ServerBuilder::new()
                    .build((Ipv4Addr::UNSPECIFIED, api_config.port))
                    .await?;
                info!(address = %server.local_addr()?, "status API listening");
                Some(server.start(api::rpc_module(context)))
            }
            None => None,
        };

        Ok(ObserverNode {
            engine,
            observer,
            broadcaster,
            store,
            tasks,
            shutdown,
            rpc_handle,
        })
    }

    pub fn engine(&self) -> &Arc<AttestationGatherer> {
        &self.engine
    }

    pub fn observer(&self) -> &Arc<ChainObserver> {
        &self.observer
    }

    pub fn broadcaster(&self) -> &Arc<BatchBroadcaster> {
        &self.broadcaster
    }

    /// Stop every task, waiting for the final broadcast flush and deck write, then close the store.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.rpc_handle.take() {
            let _ = handle.stop();
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("task failed: {e}");
            }
        }
        if let Some(store) = &self.store {
            store.close()?;
        }
        info!("observer stopped");
        Ok(())
    }
}
