use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    checkin::{evaluate, CheckInMethod, CheckInPolicy, CheckInRecord, CheckInRequest, CheckInState, PolicySource},
    clock::Clock,
    core::store::{ReservationStore, StoreSnapshotV1},
    error::{BookingError, Missing},
    op::StoredOp,
    persist::{OpSink, PersistError},
    qr::{self, QrToken},
    recurrence::RecurrenceRule,
    reservation::{Blackout, Reservation, ReservationDraft, ReservationPatch, Resource},
    types::{ActorId, BlackoutId, OpSeq, ReservationId, ResourceId, SeriesId, TimeRange},
};

use super::events::BookingEvent;

/// Runtime tuning, loadable from JSON with every field optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub persist_queue_bound: usize,
    pub command_queue_bound: usize,
    /// Write a snapshot every this many mutations (0 disables).
    pub snapshot_every_ops: usize,
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            persist_queue_bound: 64,
            command_queue_bound: 256,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Clone)]
pub struct BookingHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<BookingEvent>,
}

type Reply<T> = oneshot::Sender<Result<T, BookingError>>;

enum Command {
    RegisterResource {
        resource: Resource,
        resp: Reply<()>,
    },
    SetResourceActive {
        id: ResourceId,
        active: bool,
        resp: Reply<Resource>,
    },
    Create {
        draft: ReservationDraft,
        resp: Reply<Reservation>,
    },
    CreateSeries {
        draft: ReservationDraft,
        rule: RecurrenceRule,
        resp: Reply<Vec<Reservation>>,
    },
    Edit {
        id: ReservationId,
        patch: ReservationPatch,
        actor_id: ActorId,
        resp: Reply<Reservation>,
    },
    Cancel {
        id: ReservationId,
        actor_id: ActorId,
        resp: Reply<Reservation>,
    },
    CheckIn {
        request: CheckInRequest,
        resp: Reply<CheckInRecord>,
    },
    ScanQr {
        payload: String,
        actor_id: ActorId,
        note: String,
        resp: Reply<CheckInRecord>,
    },
    IssueQr {
        id: ReservationId,
        resp: Reply<String>,
    },
    CheckInState {
        id: ReservationId,
        resp: Reply<CheckInState>,
    },
    AddBlackout {
        resource_id: ResourceId,
        date: NaiveDate,
        range: TimeRange,
        reason: String,
        resp: Reply<Blackout>,
    },
    RemoveBlackout {
        id: BlackoutId,
        resp: Reply<Blackout>,
    },
    HasConflict {
        resource_id: ResourceId,
        date: NaiveDate,
        range: TimeRange,
        exclude: Option<ReservationId>,
        resp: oneshot::Sender<bool>,
    },
    Get {
        id: ReservationId,
        resp: oneshot::Sender<Option<Reservation>>,
    },
    ActiveOn {
        resource_id: ResourceId,
        date: NaiveDate,
        resp: oneshot::Sender<Vec<Reservation>>,
    },
    Series {
        series_id: SeriesId,
        resp: oneshot::Sender<Vec<Reservation>>,
    },
    CheckInRecordOf {
        id: ReservationId,
        resp: oneshot::Sender<Option<CheckInRecord>>,
    },
    Flush {
        resp: Reply<OpSeq>,
    },
    Checkpoint {
        resp: Reply<()>,
    },
    Shutdown {
        resp: Reply<()>,
    },
}

enum PersistMsg {
    Ops {
        ops: Vec<StoredOp>,
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

struct Context {
    clock: Arc<dyn Clock>,
    policies: Arc<dyn PolicySource>,
    config: RuntimeConfig,
}

impl Context {
    fn policy_of(&self, store: &ReservationStore, id: ReservationId) -> Result<CheckInPolicy, BookingError> {
        let facility = store
            .get(id)
            .ok_or(BookingError::NotFound(Missing::Reservation(id)))?
            .facility_id;
        Ok(self.policies.policy_for(facility))
    }
}

/// Spawns the reservation service.
///
/// One task owns `store` and executes commands one at a time, so every
/// conflict check and the write that follows it form a single critical
/// section. With a sink, a mutation replies only after its ops are durable;
/// a failed append rolls the mutation back and surfaces
/// [`BookingError::Storage`].
pub fn spawn_booking(
    store: ReservationStore,
    sink: Option<Box<dyn OpSink>>,
    clock: Arc<dyn Clock>,
    policies: Arc<dyn PolicySource>,
    config: RuntimeConfig,
) -> BookingHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<BookingEvent>(1024);

    let persist_tx = sink.map(|sink| {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        spawn_persistence_worker(sink, persist_rx);
        persist_tx
    });

    let events_tx_loop = events_tx.clone();
    let ctx = Context {
        clock,
        policies,
        config,
    };

    tokio::spawn(async move {
        let mut store = store;
        let mut ops_since_snapshot = 0usize;

        while let Some(cmd) = cmd_rx.recv().await {
            let done = handle_command(
                cmd,
                &mut store,
                &events_tx_loop,
                persist_tx.as_ref(),
                &ctx,
                &mut ops_since_snapshot,
            )
            .await;
            if done {
                break;
            }
        }
        debug!("booking runtime stopped");
    });

    BookingHandle { cmd_tx, events_tx }
}

impl BookingHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.events_tx.subscribe()
    }

    pub async fn register_resource(&self, resource: Resource) -> Result<(), BookingError> {
        self.request(|resp| Command::RegisterResource { resource, resp }).await?
    }

    pub async fn set_resource_active(&self, id: ResourceId, active: bool) -> Result<Resource, BookingError> {
        self.request(|resp| Command::SetResourceActive { id, active, resp }).await?
    }

    pub async fn create_single(&self, draft: ReservationDraft) -> Result<Reservation, BookingError> {
        self.request(|resp| Command::Create { draft, resp }).await?
    }

    /// Books every occurrence of `rule` starting at `draft.date`, or nothing.
    pub async fn create_recurring(
        &self,
        draft: ReservationDraft,
        rule: RecurrenceRule,
    ) -> Result<Vec<Reservation>, BookingError> {
        self.request(|resp| Command::CreateSeries { draft, rule, resp }).await?
    }

    pub async fn edit(
        &self,
        id: ReservationId,
        patch: ReservationPatch,
        actor_id: ActorId,
    ) -> Result<Reservation, BookingError> {
        self.request(|resp| Command::Edit {
            id,
            patch,
            actor_id,
            resp,
        })
        .await?
    }

    /// Cancelling again is a successful no-op.
    pub async fn cancel(&self, id: ReservationId, actor_id: ActorId) -> Result<Reservation, BookingError> {
        self.request(|resp| Command::Cancel { id, actor_id, resp }).await?
    }

    pub async fn check_in(&self, request: CheckInRequest) -> Result<CheckInRecord, BookingError> {
        self.request(|resp| Command::CheckIn { request, resp }).await?
    }

    /// Decodes a scanned QR payload and checks the reservation in by QR.
    pub async fn scan_qr(
        &self,
        payload: impl Into<String>,
        actor_id: ActorId,
        note: impl Into<String>,
    ) -> Result<CheckInRecord, BookingError> {
        let payload = payload.into();
        let note = note.into();
        self.request(|resp| Command::ScanQr {
            payload,
            actor_id,
            note,
            resp,
        })
        .await?
    }

    pub async fn issue_qr(&self, id: ReservationId) -> Result<String, BookingError> {
        self.request(|resp| Command::IssueQr { id, resp }).await?
    }

    pub async fn check_in_state(&self, id: ReservationId) -> Result<CheckInState, BookingError> {
        self.request(|resp| Command::CheckInState { id, resp }).await?
    }

    pub async fn add_blackout(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        range: TimeRange,
        reason: impl Into<String>,
    ) -> Result<Blackout, BookingError> {
        let reason = reason.into();
        self.request(|resp| Command::AddBlackout {
            resource_id,
            date,
            range,
            reason,
            resp,
        })
        .await?
    }

    pub async fn remove_blackout(&self, id: BlackoutId) -> Result<Blackout, BookingError> {
        self.request(|resp| Command::RemoveBlackout { id, resp }).await?
    }

    pub async fn has_conflict(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        range: TimeRange,
        exclude: Option<ReservationId>,
    ) -> Result<bool, BookingError> {
        self.request(|resp| Command::HasConflict {
            resource_id,
            date,
            range,
            exclude,
            resp,
        })
        .await
    }

    pub async fn get(&self, id: ReservationId) -> Result<Option<Reservation>, BookingError> {
        self.request(|resp| Command::Get { id, resp }).await
    }

    pub async fn active_on(&self, resource_id: ResourceId, date: NaiveDate) -> Result<Vec<Reservation>, BookingError> {
        self.request(|resp| Command::ActiveOn {
            resource_id,
            date,
            resp,
        })
        .await
    }

    pub async fn series(&self, series_id: SeriesId) -> Result<Vec<Reservation>, BookingError> {
        self.request(|resp| Command::Series { series_id, resp }).await
    }

    pub async fn check_in_record(&self, id: ReservationId) -> Result<Option<CheckInRecord>, BookingError> {
        self.request(|resp| Command::CheckInRecordOf { id, resp }).await
    }

    /// Forces the sink to stable storage and returns the highest durable sequence.
    pub async fn flush(&self) -> Result<OpSeq, BookingError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    pub async fn checkpoint(&self) -> Result<(), BookingError> {
        self.request(|resp| Command::Checkpoint { resp }).await?
    }

    pub async fn shutdown(&self) -> Result<(), BookingError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, BookingError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| BookingError::ChannelClosed)?;
        rx.await.map_err(|_| BookingError::ChannelClosed)
    }
}

async fn handle_command(
    cmd: Command,
    store: &mut ReservationStore,
    events_tx: &broadcast::Sender<BookingEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    ctx: &Context,
    ops_since_snapshot: &mut usize,
) -> bool {
    let before = store.latest_op_seq();

    match cmd {
        Command::RegisterResource { resource, resp } => {
            let outcome = store.register_resource(resource).map(|_| ());
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            let _ = resp.send(res);
        }
        Command::SetResourceActive { id, active, resp } => {
            let outcome = store.set_resource_active(id, active).map(|(resource, _)| resource);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            if let Ok(resource) = &res {
                info!(resource_id = resource.id, active = resource.active, "resource availability changed");
            }
            let _ = resp.send(res);
        }
        Command::Create { draft, resp } => {
            let actor_id = draft.booked_by;
            let outcome = store.create(draft).map(|(reservation, _)| reservation);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            match &res {
                Ok(r) => {
                    info!(reservation_id = r.id, resource_id = r.resource_id, date = %r.date, range = %r.range, "reservation created");
                    let _ = events_tx.send(BookingEvent::ReservationCreated {
                        reservation_id: r.id,
                        actor_id,
                    });
                }
                Err(err) => log_rejection("create_single", err),
            }
            let _ = resp.send(res);
        }
        Command::CreateSeries { draft, rule, resp } => {
            let actor_id = draft.booked_by;
            let outcome = store
                .create_series(draft, rule)
                .map(|(reservations, _)| reservations);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            match &res {
                Ok(reservations) => {
                    if let Some(series_id) = reservations
                        .first()
                        .and_then(|r| r.series.as_ref())
                        .map(|s| s.series_id)
                    {
                        info!(series_id, occurrences = reservations.len(), "recurring series created");
                        let _ = events_tx.send(BookingEvent::SeriesCreated {
                            series_id,
                            reservation_ids: reservations.iter().map(|r| r.id).collect(),
                            actor_id,
                        });
                    }
                }
                Err(err) => log_rejection("create_recurring", err),
            }
            let _ = resp.send(res);
        }
        Command::Edit {
            id,
            patch,
            actor_id,
            resp,
        } => {
            let outcome = store.edit(id, patch).map(|(reservation, _)| reservation);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            match &res {
                Ok(_) => {
                    info!(reservation_id = id, actor_id, "reservation edited");
                    let _ = events_tx.send(BookingEvent::ReservationEdited {
                        reservation_id: id,
                        actor_id,
                    });
                }
                Err(err) => log_rejection("edit", err),
            }
            let _ = resp.send(res);
        }
        Command::Cancel { id, actor_id, resp } => {
            let outcome = store
                .cancel(id)
                .map(|(reservation, stored)| (reservation, stored.is_some()));
            let res = match persisted(outcome, store, persist_tx, events_tx).await {
                Ok((reservation, changed)) => {
                    if changed {
                        info!(reservation_id = id, actor_id, "reservation cancelled");
                        let _ = events_tx.send(BookingEvent::ReservationCancelled {
                            reservation_id: id,
                            actor_id,
                        });
                    }
                    Ok(reservation)
                }
                Err(err) => {
                    log_rejection("cancel", &err);
                    Err(err)
                }
            };
            let _ = resp.send(res);
        }
        Command::CheckIn { request, resp } => {
            let res = check_in(request, store, events_tx, persist_tx, ctx).await;
            let _ = resp.send(res);
        }
        Command::ScanQr {
            payload,
            actor_id,
            note,
            resp,
        } => {
            let res = match qr::decode(&payload) {
                Ok(token) => {
                    let request = CheckInRequest {
                        reservation_id: token.reservation_id,
                        method: CheckInMethod::QrCode,
                        actor_id,
                        note,
                    };
                    check_in(request, store, events_tx, persist_tx, ctx).await
                }
                Err(err) => {
                    let err = BookingError::from(err);
                    log_rejection("scan_qr", &err);
                    Err(err)
                }
            };
            let _ = resp.send(res);
        }
        Command::IssueQr { id, resp } => {
            let res = match store.get(id) {
                None => Err(BookingError::NotFound(Missing::Reservation(id))),
                Some(r) if !r.is_active() => Err(BookingError::ReservationCancelled(id)),
                Some(_) => qr::encode(&QrToken::new(id, ctx.clock.now())).map_err(BookingError::from),
            };
            let _ = resp.send(res);
        }
        Command::CheckInState { id, resp } => {
            let res = ctx.policy_of(store, id).and_then(|policy| {
                let reservation = store
                    .get(id)
                    .ok_or(BookingError::NotFound(Missing::Reservation(id)))?;
                Ok(evaluate(reservation, &policy, ctx.clock.now()))
            });
            let _ = resp.send(res);
        }
        Command::AddBlackout {
            resource_id,
            date,
            range,
            reason,
            resp,
        } => {
            let outcome = store
                .add_blackout(resource_id, date, range, reason)
                .map(|(blackout, _)| blackout);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            if let Ok(b) = &res {
                info!(blackout_id = b.id, resource_id, date = %date, range = %range, "blackout added");
            }
            let _ = resp.send(res);
        }
        Command::RemoveBlackout { id, resp } => {
            let outcome = store.remove_blackout(id).map(|(blackout, _)| blackout);
            let res = persisted(outcome, store, persist_tx, events_tx).await;
            let _ = resp.send(res);
        }
        Command::HasConflict {
            resource_id,
            date,
            range,
            exclude,
            resp,
        } => {
            let _ = resp.send(store.has_conflict(resource_id, date, &range, exclude));
        }
        Command::Get { id, resp } => {
            let _ = resp.send(store.get_cloned(id));
        }
        Command::ActiveOn {
            resource_id,
            date,
            resp,
        } => {
            let _ = resp.send(store.active_on_cloned(resource_id, date));
        }
        Command::Series { series_id, resp } => {
            let _ = resp.send(store.series_cloned(series_id));
        }
        Command::CheckInRecordOf { id, resp } => {
            let _ = resp.send(store.check_in_record(id).cloned());
        }
        Command::Flush { resp } => {
            let out = match persist_tx {
                Some(tx) => ask_worker(tx, |resp| PersistMsg::Flush { resp }).await,
                None => Ok(store.latest_op_seq()),
            };
            let _ = resp.send(out);
        }
        Command::Checkpoint { resp } => {
            let out = match persist_tx {
                Some(tx) => request_checkpoint(store, tx, &ctx.config)
                    .await
                    .map(|()| *ops_since_snapshot = 0),
                None => Ok(()),
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = match persist_tx {
                Some(tx) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                        Err(BookingError::ChannelClosed)
                    } else {
                        done_rx.await.map_err(|_| BookingError::ChannelClosed)
                    }
                }
                None => Ok(()),
            };
            let _ = resp.send(out);
            return true;
        }
    }

    let committed = store.latest_op_seq().saturating_sub(before) as usize;
    if committed > 0 {
        *ops_since_snapshot += committed;
        maybe_auto_checkpoint(store, persist_tx, &ctx.config, ops_since_snapshot).await;
    }

    false
}

async fn check_in(
    request: CheckInRequest,
    store: &mut ReservationStore,
    events_tx: &broadcast::Sender<BookingEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    ctx: &Context,
) -> Result<CheckInRecord, BookingError> {
    let outcome = ctx
        .policy_of(store, request.reservation_id)
        .and_then(|policy| store.check_in(request, &policy, ctx.clock.now()))
        .map(|(record, _, _)| record);
    let res = persisted(outcome, store, persist_tx, events_tx).await;

    match &res {
        Ok(record) => {
            info!(
                reservation_id = record.reservation_id,
                method = record.method.kind().as_str(),
                "checked in"
            );
            let _ = events_tx.send(BookingEvent::CheckedIn {
                reservation_id: record.reservation_id,
                actor_id: record.actor_id,
                method: record.method.kind(),
            });
        }
        Err(err) => log_rejection("check_in", err),
    }
    res
}

fn log_rejection(operation: &'static str, err: &BookingError) {
    match err {
        BookingError::Storage(_) | BookingError::ChannelClosed => {
            warn!(operation, error = %err, "booking command failed");
        }
        _ => debug!(operation, error = %err, "booking command rejected"),
    }
}

async fn persisted<T>(
    outcome: Result<T, BookingError>,
    store: &mut ReservationStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    events_tx: &broadcast::Sender<BookingEvent>,
) -> Result<T, BookingError> {
    let value = outcome?;
    journal(store, persist_tx, events_tx).await?;
    Ok(value)
}

// Waits for the sink to acknowledge the ops of the last mutation. On any
// failure the mutation is reverted before the error is returned.
async fn journal(
    store: &mut ReservationStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    events_tx: &broadcast::Sender<BookingEvent>,
) -> Result<(), BookingError> {
    let pending = store.take_pending();
    if pending.ops.is_empty() {
        return Ok(());
    }
    let Some(tx) = persist_tx else {
        let _ = events_tx.send(BookingEvent::DurableUpTo {
            op_seq: store.latest_op_seq(),
        });
        return Ok(());
    };

    let ops = pending.ops.clone();
    match ask_worker(tx, |resp| PersistMsg::Ops { ops, resp }).await {
        Ok(op_seq) => {
            let _ = events_tx.send(BookingEvent::DurableUpTo { op_seq });
            Ok(())
        }
        Err(err) => {
            let ops = pending.ops.len();
            match store.revert(pending) {
                Ok(()) => warn!(error = %err, ops, "journal append failed, mutation rolled back"),
                Err(revert_err) => warn!(error = %err, %revert_err, ops, "journal append failed, rollback incomplete"),
            }
            Err(err)
        }
    }
}

async fn ask_worker<T>(
    tx: &mpsc::Sender<PersistMsg>,
    make: impl FnOnce(oneshot::Sender<Result<T, PersistError>>) -> PersistMsg,
) -> Result<T, BookingError> {
    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(make(resp_tx))
        .await
        .map_err(|_| BookingError::ChannelClosed)?;
    resp_rx
        .await
        .map_err(|_| BookingError::ChannelClosed)?
        .map_err(BookingError::from)
}

fn spawn_persistence_worker(sink: Box<dyn OpSink>, mut rx: mpsc::Receiver<PersistMsg>) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut last_durable: OpSeq = 0;

        while let Some(msg) = rx.recv().await {
            match msg {
                PersistMsg::Ops { ops, resp } => {
                    let count = ops.len();
                    let result = with_sink(&sink, move |sink| sink.append_ops(&ops)).await;
                    match &result {
                        Ok(seq) => {
                            last_durable = last_durable.max(*seq);
                            debug!(ops = count, op_seq = *seq, "journal appended");
                        }
                        Err(err) => warn!(error = %err, ops = count, "journal append failed"),
                    }
                    let _ = resp.send(result.map(|_| last_durable));
                }
                PersistMsg::Flush { resp } => {
                    let result = with_sink(&sink, |sink| sink.flush()).await;
                    let _ = resp.send(result.map(|()| last_durable));
                }
                PersistMsg::Checkpoint {
                    snapshot,
                    last_seq,
                    compact,
                    resp,
                } => {
                    let result = with_sink(&sink, move |sink| {
                        sink.flush()?;
                        sink.write_snapshot(&snapshot, last_seq)?;
                        if compact {
                            let removed = sink.compact_through(last_seq)?;
                            debug!(removed, last_seq, "journal compacted");
                        }
                        Ok(())
                    })
                    .await;
                    match &result {
                        Ok(()) => info!(last_seq, "snapshot written"),
                        Err(err) => warn!(error = %err, last_seq, "snapshot failed"),
                    }
                    let _ = resp.send(result);
                }
                PersistMsg::Shutdown { resp } => {
                    if let Err(err) = with_sink(&sink, |sink| sink.flush()).await {
                        warn!(error = %err, "final flush failed");
                    }
                    let _ = resp.send(());
                    break;
                }
            }
        }
        debug!("persistence worker stopped");
    });
}

async fn with_sink<T, F>(sink: &Arc<Mutex<Box<dyn OpSink>>>, f: F) -> Result<T, PersistError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn OpSink) -> Result<T, PersistError> + Send + 'static,
{
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        f(&mut **sink)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?
}

async fn request_checkpoint(
    store: &ReservationStore,
    tx: &mpsc::Sender<PersistMsg>,
    config: &RuntimeConfig,
) -> Result<(), BookingError> {
    let snapshot = store.export_snapshot();
    let last_seq = store.latest_op_seq();
    let compact = config.compact_after_snapshot;
    ask_worker(tx, |resp| PersistMsg::Checkpoint {
        snapshot,
        last_seq,
        compact,
        resp,
    })
    .await
}

async fn maybe_auto_checkpoint(
    store: &ReservationStore,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
    config: &RuntimeConfig,
    ops_since_snapshot: &mut usize,
) {
    if config.snapshot_every_ops == 0 || *ops_since_snapshot < config.snapshot_every_ops {
        return;
    }

    let Some(tx) = persist_tx else {
        return;
    };

    match request_checkpoint(store, tx, config).await {
        Ok(()) => *ops_since_snapshot = 0,
        Err(err) => warn!(error = %err, pending = *ops_since_snapshot, "automatic snapshot failed"),
    }
}
