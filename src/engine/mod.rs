mod conflict;
mod directory;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::limits::{DEFAULT_BOOKING_HORIZON_MS, DEFAULT_MAX_QUERY_WINDOW_MS};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use directory::Directory;

/// Per-tenant knobs, shared by every engine the server creates.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Identities that may use the administrative path in every tenant.
    pub admins: HashSet<String>,
    /// How far ahead a reservation may end. `None` disables the booking window.
    pub booking_horizon: Option<Ms>,
    /// Widest window a listing query may span.
    pub max_query_window: Ms,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            admins: HashSet::new(),
            booking_horizon: None,
            max_query_window: DEFAULT_MAX_QUERY_WINDOW_MS,
        }
    }
}

impl EngineOptions {
    /// Options as the server runs them: two-month booking window.
    pub fn production(admins: HashSet<String>) -> Self {
        Self {
            admins,
            booking_horizon: Some(DEFAULT_BOOKING_HORIZON_MS),
            ..Self::default()
        }
    }
}

// ── Group-commit WAL writer ──────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL on a background task. Every append that is already queued when
/// the writer wakes up goes into the same batch and shares one fsync.
struct GroupCommitWriter {
    wal: Wal,
    rx: mpsc::Receiver<WalCommand>,
}

impl GroupCommitWriter {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let mut batch = Vec::new();
            let mut deferred = None;
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => deferred = Some(other),
            }

            while deferred.is_none() {
                match self.rx.try_recv() {
                    Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                    Ok(other) => deferred = Some(other),
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                self.commit(batch);
            }
            if let Some(cmd) = deferred {
                self.handle_control(cmd);
            }
        }
        debug!("WAL writer stopped");
    }

    fn commit(&mut self, batch: Vec<PendingAppend>) {
        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();

        // All or nothing: a failed batch leaves no trace in the file.
        let result = batch
            .iter()
            .try_for_each(|(event, _)| self.wal.append_buffered(event))
            .and_then(|()| self.wal.flush_sync());
        if result.is_err() {
            self.wal.rollback();
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            warn!("WAL commit of {} events failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }
    }

    fn handle_control(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(self.wal.path(), &events)
                    .and_then(|()| self.wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append { event, response } => self.commit(vec![(event, response)]),
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking store of one laundry room.
pub struct Engine {
    /// Held for writing across check, WAL append and apply: this is what makes
    /// check-and-insert atomic.
    ledger: RwLock<BookingLedger>,
    directory: Directory,
    /// Serializes profile and admin writes.
    directory_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    options: EngineOptions,
}

/// Apply a reservation event to the ledger (caller holds the write lock).
fn apply_to_ledger(ledger: &mut BookingLedger, event: &Event) {
    match event {
        Event::ReservationCreated {
            id,
            owner_id,
            span,
            created_at,
        } => {
            ledger.insert(Reservation {
                id: *id,
                owner_id: owner_id.clone(),
                span: *span,
                created_at: *created_at,
            });
        }
        Event::ReservationUpdated { id, span } => {
            ledger.reschedule(id, *span);
        }
        Event::ReservationDeleted { id } => {
            ledger.remove(id);
        }
        Event::ProfileCreated { .. }
        | Event::ProfileUpdated { .. }
        | Event::AdminGranted { .. }
        | Event::AdminRevoked { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, options: EngineOptions) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        // Nobody else can see these yet, so replay mutates them directly.
        let mut ledger = BookingLedger::new();
        let directory = Directory::default();
        for event in &events {
            if event.is_reservation_event() {
                apply_to_ledger(&mut ledger, event);
            } else {
                directory.apply(event);
            }
        }
        debug!(
            "replayed {} events from {}: {} reservations, {} profiles",
            events.len(),
            wal_path.display(),
            ledger.len(),
            directory.profile_count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(GroupCommitWriter { wal, rx: wal_rx }.run());

        Ok(Self {
            ledger: RwLock::new(ledger),
            directory,
            directory_lock: Mutex::new(()),
            wal_tx,
            notify,
            options,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<io::Result<T>>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably append one event via the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.wal_request(cmd, rx).await
    }

    /// WAL-append + apply + notify for reservation events.
    pub(super) async fn persist_reservation_event(
        &self,
        ledger: &mut BookingLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event);
        self.notify.publish(event);
        Ok(())
    }

    /// WAL-append + apply + notify for profile and admin events.
    /// Caller holds `directory_lock`.
    pub(super) async fn persist_directory_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.directory.apply(event);
        self.notify.publish(event);
        Ok(())
    }

    /// Rewrite the WAL with just the events that recreate the current state.
    ///
    /// Both state locks are held until the writer has swapped the file, so no
    /// commit can slip in between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _directory = self.directory_lock.lock().await;
        let ledger = self.ledger.read().await;

        let mut events = Vec::new();
        for profile in self.directory.profiles() {
            events.push(Event::ProfileCreated {
                id: profile.id.clone(),
                created_at: profile.created_at,
            });
            if profile.display_name.is_some() || profile.color.is_some() {
                events.push(Event::ProfileUpdated {
                    id: profile.id,
                    display_name: profile.display_name,
                    color: profile.color,
                });
            }
        }
        for id in self.directory.granted_admins() {
            events.push(Event::AdminGranted { id });
        }
        for reservation in ledger.iter() {
            events.push(Event::ReservationCreated {
                id: reservation.id,
                owner_id: reservation.owner_id.clone(),
                span: reservation.span,
                created_at: reservation.created_at,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await?;
        Ok(count)
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
