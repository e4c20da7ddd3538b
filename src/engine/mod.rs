mod conflict;
mod confirmation;
mod error;
mod intake;
mod lifecycle;
mod mutations;
mod queries;
mod selection;

pub use conflict::{confirmed_overlap, find_conflicts};
pub use error::EngineError;
pub use lifecycle::{ACTIVE_STATUSES, check_transition, override_to_rejected, transition};
pub use queries::ReservationFilter;
pub use selection::{ServerCandidate, select_server};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::oracle::OracleAdapter;
use crate::wal::{Txn, Wal};

pub type SharedServerState = Arc<RwLock<ServerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Txn,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        txns: Vec<Txn>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Txn, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => batch.push((txn, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands run only after the batch ahead of them is durable.
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { txns, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &txns).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { txn, response } => {
            let mut batch = vec![(txn, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub(crate) state: DashMap<Ulid, SharedServerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → server id
    pub(super) reservation_to_server: DashMap<Ulid, Ulid>,
    /// Unique server names → server id
    pub(super) server_names: DashMap<String, Ulid>,
    /// Serialises reservation intake per server across the oracle calls.
    pub(super) arbitration: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Held for writing by `compact_wal`, for reading by `create_server`.
    /// A server must not commit between the compaction snapshot and the swap.
    pub(super) compaction: RwLock<()>,
    pub(super) oracle: OracleAdapter,
}

/// Server-level bookkeeping shared by live commits and replay.
struct Indexes<'a> {
    reservations: &'a DashMap<Ulid, Ulid>,
    names: &'a DashMap<String, Ulid>,
}

/// Apply an event directly to a ServerState (caller holds the lock).
fn apply_to_server(ss: &mut ServerState, event: &Event, idx: &Indexes<'_>) {
    match event {
        Event::ServerUpdated {
            id,
            name,
            description,
            gpu_type,
            gpu_count,
        } => {
            if ss.info.name != *name {
                idx.names.remove_if(&ss.info.name, |_, owner| owner == id);
                idx.names.insert(name.clone(), *id);
            }
            ss.info.name = name.clone();
            ss.info.description = description.clone();
            ss.info.gpu_type = gpu_type.clone();
            ss.info.gpu_count = *gpu_count;
        }
        Event::ServerDeactivated { .. } => ss.info.active = false,
        Event::ReservationCreated { reservation } => {
            idx.reservations
                .insert(reservation.id, reservation.server_id);
            ss.insert_reservation(reservation.clone());
        }
        Event::StatusChanged {
            id,
            status,
            rejection_reason,
            judgment_reason,
            at,
            ..
        } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = *status;
                r.rejection_reason = rejection_reason.clone();
                r.judgment_reason = judgment_reason.clone();
                r.updated_at = *at;
            }
        }
        Event::ConflictRecorded { conflict } => ss.conflicts.push(conflict.clone()),
        Event::ConflictResolved { id, resolution, .. } => {
            if let Some(c) = ss.conflict_mut(id) {
                c.resolved = true;
                c.resolution = *resolution;
            }
        }
        // ServerCreated is handled at the DashMap level, not here
        Event::ServerCreated { .. } => {}
    }
}

/// Status update event carrying a working copy's current fields.
pub(super) fn status_changed(r: &Reservation) -> Event {
    Event::StatusChanged {
        id: r.id,
        server_id: r.server_id,
        status: r.status,
        rejection_reason: r.rejection_reason.clone(),
        judgment_reason: r.judgment_reason.clone(),
        at: r.updated_at,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        oracle: OracleAdapter,
    ) -> io::Result<Self> {
        let txns = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_server: DashMap::new(),
            server_names: DashMap::new(),
            arbitration: DashMap::new(),
            compaction: RwLock::new(()),
            oracle,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this runs inside the runtime.
        let mut applied = 0usize;
        for event in txns.iter().flatten() {
            match event {
                Event::ServerCreated { server } => engine.install_server(server.clone()),
                other => {
                    if let Some(entry) = engine.state.get(&other.server_id()) {
                        let ss = entry.value().clone();
                        let mut guard = ss.try_write().expect("replay: uncontended write");
                        apply_to_server(&mut guard, other, &engine.indexes());
                    }
                }
            }
            applied += 1;
        }
        if applied > 0 {
            tracing::info!(
                transactions = txns.len(),
                events = applied,
                servers = engine.state.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    fn indexes(&self) -> Indexes<'_> {
        Indexes {
            reservations: &self.reservation_to_server,
            names: &self.server_names,
        }
    }

    /// Register a server's state and name. Also used when replaying `ServerCreated`.
    pub(super) fn install_server(&self, server: GpuServer) {
        self.server_names.insert(server.name.clone(), server.id);
        self.state
            .insert(server.id, Arc::new(RwLock::new(ServerState::new(server))));
    }

    /// Write a transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_commit(&self, txn: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_server_state(&self, id: &Ulid) -> Option<SharedServerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_server_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_server
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-commit + apply + notify. Memory is only touched once the
    /// transaction is durable.
    pub(super) async fn persist_and_apply(
        &self,
        server_id: Ulid,
        ss: &mut ServerState,
        txn: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_commit(txn).await?;
        let idx = self.indexes();
        for event in txn {
            apply_to_server(ss, event, &idx);
        }
        for event in txn {
            self.notify.send(server_id, event);
        }
        Ok(())
    }

    /// Lookup reservation → server, get server, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ServerState>), EngineError> {
        let server_id = self
            .get_server_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let ss = self
            .get_server_state(&server_id)
            .ok_or(EngineError::NotFound(server_id))?;
        let guard = ss.write_owned().await;
        Ok((server_id, guard))
    }

    pub(super) fn arbitration_lock(&self, server_id: Ulid) -> Arc<Mutex<()>> {
        self.arbitration.entry(server_id).or_default().clone()
    }
}
