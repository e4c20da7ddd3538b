use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Txn;

use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

fn validate_server_fields(
    name: &str,
    description: Option<&str>,
    gpu_type: Option<&str>,
) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::LimitExceeded("server name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("server name too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("server description too long"));
    }
    if gpu_type.is_some_and(|t| t.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("gpu type too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_server(
        &self,
        name: &str,
        description: Option<String>,
        gpu_type: Option<String>,
        gpu_count: u32,
    ) -> Result<GpuServer, EngineError> {
        let name = name.trim().to_string();
        validate_server_fields(&name, description.as_deref(), gpu_type.as_deref())?;
        let _compaction = self.compaction.read().await;
        if self.state.len() >= MAX_SERVERS {
            return Err(EngineError::LimitExceeded("too many servers"));
        }

        let server = GpuServer {
            id: Ulid::new(),
            name: name.clone(),
            description,
            gpu_type,
            gpu_count,
            active: true,
            created_at: now_ms(),
        };

        // Claim the name before the WAL round-trip so concurrent creates can't both win.
        match self.server_names.entry(name.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(name)),
            Entry::Vacant(slot) => {
                slot.insert(server.id);
            }
        }

        let event = Event::ServerCreated {
            server: server.clone(),
        };
        if let Err(e) = self.wal_commit(std::slice::from_ref(&event)).await {
            self.server_names.remove(&name);
            return Err(e);
        }
        self.install_server(server.clone());
        self.notify.send(server.id, &event);
        info!(server_id = %server.id, name = %server.name, "server created");
        Ok(server)
    }

    /// Replace a server's descriptive fields. Its reservations are untouched.
    pub async fn update_server(
        &self,
        id: Ulid,
        name: &str,
        description: Option<String>,
        gpu_type: Option<String>,
        gpu_count: u32,
    ) -> Result<GpuServer, EngineError> {
        let name = name.trim().to_string();
        validate_server_fields(&name, description.as_deref(), gpu_type.as_deref())?;
        let ss = self.get_server_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;

        let renamed = guard.info.name != name;
        if renamed {
            match self.server_names.entry(name.clone()) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(name)),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let event = Event::ServerUpdated {
            id,
            name: name.clone(),
            description,
            gpu_type,
            gpu_count,
        };
        if let Err(e) = self
            .persist_and_apply(id, &mut guard, std::slice::from_ref(&event))
            .await
        {
            if renamed {
                self.server_names.remove(&name);
            }
            return Err(e);
        }
        Ok(guard.info.clone())
    }

    /// Take a server out of selection. Idempotent.
    pub async fn deactivate_server(&self, id: Ulid) -> Result<GpuServer, EngineError> {
        let ss = self.get_server_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        if guard.info.active {
            let event = Event::ServerDeactivated { id };
            self.persist_and_apply(id, &mut guard, std::slice::from_ref(&event))
                .await?;
            info!(server_id = %id, "server deactivated");
        }
        Ok(guard.info.clone())
    }

    /// Rewrite the WAL as one transaction per server holding its current state.
    ///
    /// Every server's read lock is held until the swap completes, so no
    /// reservation change can land between snapshot and swap. Server creation
    /// waits for the whole compaction.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;
        let servers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(servers.len());
        for ss in servers {
            guards.push(ss.read_owned().await);
        }

        let mut txns: Vec<Txn> = Vec::with_capacity(guards.len());
        for guard in &guards {
            let mut txn = Vec::with_capacity(1 + guard.reservations.len() + guard.conflicts.len());
            txn.push(Event::ServerCreated {
                server: guard.info.clone(),
            });
            txn.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
            txn.extend(guard.conflicts.iter().map(|c| Event::ConflictRecorded {
                conflict: c.clone(),
            }));
            txns.push(txn);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { txns, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        if result.is_ok() {
            info!(servers = self.state.len(), "WAL compacted");
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
