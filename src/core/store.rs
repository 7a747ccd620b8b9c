use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, NaiveDateTime};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    checkin::{verify, CheckInPolicy, CheckInRecord, CheckInRequest},
    error::{BookingError, Missing},
    op::{Op, StoredOp},
    recurrence::{expand, RecurrenceRule},
    reservation::{Blackout, Reservation, ReservationDraft, ReservationPatch, Resource, SeriesInfo},
    types::{
        BlackoutId, CheckInId, FacilityId, OpSeq, ReservationId, ReservationStatus, ResourceId,
        SeriesId, TimeRange,
    },
};

use super::{
    conflict::{find_overlap, Collision, Conflict},
    indices::{remove_from_slot, SlotIndex, SlotKey},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    pub next_op_seq: OpSeq,
    pub next_reservation_id: ReservationId,
    pub next_series_id: SeriesId,
    pub next_blackout_id: BlackoutId,
    pub next_check_in_id: CheckInId,
    pub resources: Vec<Resource>,
    pub reservations: Vec<Reservation>,
    pub blackouts: Vec<Blackout>,
    pub check_ins: Vec<CheckInRecord>,
}

// Pre-image of one committed op.
#[derive(Debug, Clone)]
enum Undo {
    Resource {
        id: ResourceId,
        prior: Option<Resource>,
    },
    Insert(Vec<Reservation>),
    Update(Reservation),
    CheckIn {
        prior: Reservation,
        record_id: CheckInId,
    },
    AddBlackout(Blackout),
    RemoveBlackout(Blackout),
}

#[derive(Debug, Default)]
pub struct PendingOps {
    pub ops: Vec<StoredOp>,
    undo: Vec<Undo>,
}

/// Authoritative reservation table.
///
/// Every mutation validates against current state and then commits exactly
/// one [`Op`], so a caller that owns the store exclusively gets
/// check-then-insert as a single critical section.
#[derive(Debug, Default)]
pub struct ReservationStore {
    resources: HashMap<ResourceId, Resource>,
    records: HashMap<ReservationId, Reservation>,
    order: Vec<ReservationId>,
    by_slot: SlotIndex<ReservationId>,
    by_series: HashMap<SeriesId, Vec<ReservationId>>,
    blackouts: HashMap<BlackoutId, Blackout>,
    blackouts_by_slot: SlotIndex<BlackoutId>,
    check_ins: HashMap<ReservationId, CheckInRecord>,
    pending: PendingOps,
    next_op_seq: OpSeq,
    next_reservation_id: ReservationId,
    next_series_id: SeriesId,
    next_blackout_id: BlackoutId,
    next_check_in_id: CheckInId,
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            next_reservation_id: 1,
            next_series_id: 1,
            next_blackout_id: 1,
            next_check_in_id: 1,
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, BookingError> {
        let mut store = Self::new();

        for resource in snapshot.resources {
            store.apply_op(Op::UpsertResource { resource })?;
        }
        store.apply_op(Op::Insert {
            reservations: snapshot.reservations,
        })?;
        for blackout in snapshot.blackouts {
            store.apply_op(Op::AddBlackout { blackout })?;
        }
        for record in snapshot.check_ins {
            store.bump_ids_for_check_in(record.id);
            store.check_ins.insert(record.reservation_id, record);
        }

        store.next_op_seq = snapshot.next_op_seq;
        store.next_reservation_id = store.next_reservation_id.max(snapshot.next_reservation_id);
        store.next_series_id = store.next_series_id.max(snapshot.next_series_id);
        store.next_blackout_id = store.next_blackout_id.max(snapshot.next_blackout_id);
        store.next_check_in_id = store.next_check_in_id.max(snapshot.next_check_in_id);
        Ok(store)
    }

    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let mut resources: Vec<Resource> = self.resources.values().cloned().collect();
        resources.sort_by_key(|r| r.id);
        let mut blackouts: Vec<Blackout> = self.blackouts.values().cloned().collect();
        blackouts.sort_by_key(|b| b.id);
        let mut check_ins: Vec<CheckInRecord> = self.check_ins.values().cloned().collect();
        check_ins.sort_by_key(|c| c.id);

        StoreSnapshotV1 {
            next_op_seq: self.next_op_seq,
            next_reservation_id: self.next_reservation_id,
            next_series_id: self.next_series_id,
            next_blackout_id: self.next_blackout_id,
            next_check_in_id: self.next_check_in_id,
            resources,
            reservations: self
                .order
                .iter()
                .filter_map(|id| self.records.get(id).cloned())
                .collect(),
            blackouts,
            check_ins,
        }
    }

    pub fn register_resource(&mut self, resource: Resource) -> Result<StoredOp, BookingError> {
        self.commit(Op::UpsertResource { resource })
    }

    // Existing reservations on the resource are left untouched.
    pub fn set_resource_active(
        &mut self,
        id: ResourceId,
        active: bool,
    ) -> Result<(Resource, StoredOp), BookingError> {
        let mut resource = self
            .resources
            .get(&id)
            .cloned()
            .ok_or(BookingError::NotFound(Missing::Resource(id)))?;
        resource.active = active;
        let stored = self.commit(Op::UpsertResource {
            resource: resource.clone(),
        })?;
        Ok((resource, stored))
    }

    pub fn has_conflict(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        range: &TimeRange,
        exclude: Option<ReservationId>,
    ) -> bool {
        self.find_conflict(resource_id, date, range, exclude).is_some()
    }

    pub fn find_conflict(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        range: &TimeRange,
        exclude: Option<ReservationId>,
    ) -> Option<Conflict> {
        let key = SlotKey::new(resource_id, date);
        let (collides_with, colliding_range) =
            find_overlap(range, self.slot_records(key), self.slot_blackouts(key), exclude)?;
        Some(Conflict {
            resource_id,
            date,
            requested: *range,
            occurrence: None,
            collides_with,
            colliding_range,
        })
    }

    pub fn create(&mut self, draft: ReservationDraft) -> Result<(Reservation, StoredOp), BookingError> {
        draft.range.validate()?;
        let facility_id = self.bookable_resource(draft.resource_id)?.facility_id;
        if let Some(conflict) = self.find_conflict(draft.resource_id, draft.date, &draft.range, None) {
            return Err(conflict.into());
        }

        let reservation = self.materialize(&draft, facility_id, draft.date, None);
        let stored = self.commit(Op::Insert {
            reservations: vec![reservation.clone()],
        })?;
        Ok((reservation, stored))
    }

    /// Creates every occurrence of `rule` or nothing.
    ///
    /// All occurrences are checked before any is written; the first collision
    /// is returned with its 1-based position in `occurrence`.
    pub fn create_series(
        &mut self,
        draft: ReservationDraft,
        rule: RecurrenceRule,
    ) -> Result<(Vec<Reservation>, StoredOp), BookingError> {
        draft.range.validate()?;
        let facility_id = self.bookable_resource(draft.resource_id)?.facility_id;
        let dates = expand(draft.date, &rule)?;

        for (idx, date) in dates.iter().enumerate() {
            let position = idx as u32 + 1;
            if let Some(mut conflict) = self.find_conflict(draft.resource_id, *date, &draft.range, None) {
                conflict.occurrence = Some(position);
                return Err(conflict.into());
            }
            if let Some(earlier) = dates[..idx].iter().position(|d| d == date) {
                return Err(Conflict {
                    resource_id: draft.resource_id,
                    date: *date,
                    requested: draft.range,
                    occurrence: Some(position),
                    collides_with: Collision::SeriesOccurrence(earlier as u32 + 1),
                    colliding_range: draft.range,
                }
                .into());
            }
        }

        let series_id = self.next_series_id;
        let reservations: Vec<Reservation> = dates
            .iter()
            .enumerate()
            .map(|(idx, date)| {
                let series = SeriesInfo {
                    series_id,
                    position: idx as u32 + 1,
                    rule: rule.clone(),
                };
                self.materialize(&draft, facility_id, *date, Some(series))
            })
            .collect();

        let stored = self.commit(Op::Insert {
            reservations: reservations.clone(),
        })?;
        Ok((reservations, stored))
    }

    // Once checked in, only payment and notes may change.
    pub fn edit(
        &mut self,
        id: ReservationId,
        patch: ReservationPatch,
    ) -> Result<(Reservation, StoredOp), BookingError> {
        let current = self.get(id).ok_or(BookingError::NotFound(Missing::Reservation(id)))?;
        if !current.is_active() {
            return Err(BookingError::ReservationCancelled(id));
        }
        if patch.is_empty() {
            return Err(BookingError::Validation("edit changes nothing".to_string()));
        }
        if patch.status == Some(ReservationStatus::Cancelled) {
            return Err(BookingError::Validation(
                "cancellation must go through cancel".to_string(),
            ));
        }
        if current.checked_in && (patch.moves_slot() || patch.status.is_some()) {
            return Err(BookingError::AlreadyCheckedIn {
                reservation_id: id,
                checked_in_at: current.checked_in_at.unwrap_or_default(),
            });
        }

        let mut updated = current.clone();
        patch.apply_to(&mut updated);
        updated.range.validate()?;

        if patch.moves_slot() {
            updated.facility_id = self.bookable_resource(updated.resource_id)?.facility_id;
            if let Some(conflict) =
                self.find_conflict(updated.resource_id, updated.date, &updated.range, Some(id))
            {
                return Err(conflict.into());
            }
        }

        let stored = self.commit(Op::Update {
            reservation: updated.clone(),
        })?;
        Ok((updated, stored))
    }

    // Cancelling twice succeeds without a new op.
    pub fn cancel(&mut self, id: ReservationId) -> Result<(Reservation, Option<StoredOp>), BookingError> {
        let current = self.get(id).ok_or(BookingError::NotFound(Missing::Reservation(id)))?;
        if !current.is_active() {
            return Ok((current.clone(), None));
        }

        let mut cancelled = current.clone();
        cancelled.status = ReservationStatus::Cancelled;
        let stored = self.commit(Op::Update {
            reservation: cancelled.clone(),
        })?;
        Ok((cancelled, Some(stored)))
    }

    /// Verifies and records a check-in.
    ///
    /// The `checked_in` flag is tested and set in the same call, so of two
    /// attempts on one store exactly one records; the other gets
    /// [`BookingError::AlreadyCheckedIn`].
    pub fn check_in(
        &mut self,
        request: CheckInRequest,
        policy: &CheckInPolicy,
        now: NaiveDateTime,
    ) -> Result<(CheckInRecord, Reservation, StoredOp), BookingError> {
        let id = request.reservation_id;
        let current = self.get(id).ok_or(BookingError::NotFound(Missing::Reservation(id)))?;
        let verified = verify(current, policy, &request.method, now)?;

        let mut reservation = current.clone();
        reservation.checked_in = true;
        reservation.checked_in_at = Some(now);
        reservation.status = ReservationStatus::Confirmed;

        let record = CheckInRecord {
            id: self.next_check_in_id,
            reservation_id: id,
            method: request.method,
            checked_in_at: now,
            actor_id: request.actor_id,
            note: request.note,
            distance_m: verified.distance_m,
        };

        let stored = self.commit(Op::CheckIn {
            record: record.clone(),
            reservation: reservation.clone(),
        })?;
        Ok((record, reservation, stored))
    }

    // Existing reservations under the new blackout stay in place.
    pub fn add_blackout(
        &mut self,
        resource_id: ResourceId,
        date: NaiveDate,
        range: TimeRange,
        reason: impl Into<String>,
    ) -> Result<(Blackout, StoredOp), BookingError> {
        range.validate()?;
        if !self.resources.contains_key(&resource_id) {
            return Err(BookingError::NotFound(Missing::Resource(resource_id)));
        }

        let blackout = Blackout {
            id: self.next_blackout_id,
            resource_id,
            date,
            range,
            reason: reason.into(),
        };
        let stored = self.commit(Op::AddBlackout {
            blackout: blackout.clone(),
        })?;
        Ok((blackout, stored))
    }

    pub fn remove_blackout(&mut self, id: BlackoutId) -> Result<(Blackout, StoredOp), BookingError> {
        let blackout = self
            .blackouts
            .get(&id)
            .cloned()
            .ok_or(BookingError::NotFound(Missing::Blackout(id)))?;
        let stored = self.commit(Op::RemoveBlackout { id })?;
        Ok((blackout, stored))
    }

    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), BookingError> {
        let seq = stored.seq;
        self.apply_op(stored.op)?;
        self.bump_next_seq_from(seq);
        Ok(())
    }

    pub fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.records.get(&id)
    }

    pub fn get_cloned(&self, id: ReservationId) -> Option<Reservation> {
        self.get(id).cloned()
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn active_on(&self, resource_id: ResourceId, date: NaiveDate) -> Vec<&Reservation> {
        let mut out: Vec<&Reservation> = self
            .slot_records(SlotKey::new(resource_id, date))
            .filter(|r| r.is_active())
            .collect();
        out.sort_by_key(|r| (r.range.start, r.id));
        out
    }

    pub fn active_on_cloned(&self, resource_id: ResourceId, date: NaiveDate) -> Vec<Reservation> {
        self.active_on(resource_id, date).into_iter().cloned().collect()
    }

    pub fn blackouts_on(&self, resource_id: ResourceId, date: NaiveDate) -> Vec<&Blackout> {
        self.slot_blackouts(SlotKey::new(resource_id, date)).collect()
    }

    pub fn series(&self, series_id: SeriesId) -> Vec<&Reservation> {
        self.by_series
            .get(&series_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn series_cloned(&self, series_id: SeriesId) -> Vec<Reservation> {
        self.series(series_id).into_iter().cloned().collect()
    }

    pub fn check_in_record(&self, reservation_id: ReservationId) -> Option<&CheckInRecord> {
        self.check_ins.get(&reservation_id)
    }

    pub fn check_in_count(&self) -> usize {
        self.check_ins.len()
    }

    pub fn ordered_ids(&self) -> &[ReservationId] {
        &self.order
    }

    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        self.take_pending().ops
    }

    pub fn take_pending(&mut self) -> PendingOps {
        std::mem::take(&mut self.pending)
    }

    // Only valid while nothing has been committed since `pending` was taken.
    pub fn revert(&mut self, pending: PendingOps) -> Result<(), BookingError> {
        let Some(first_seq) = pending.ops.first().map(|s| s.seq) else {
            return Ok(());
        };

        for undo in pending.undo.into_iter().rev() {
            match undo {
                Undo::Resource { id, prior } => match prior {
                    Some(resource) => {
                        self.resources.insert(id, resource);
                    }
                    None => {
                        self.resources.remove(&id);
                    }
                },
                Undo::Insert(reservations) => {
                    for reservation in reservations.into_iter().rev() {
                        self.remove_record(&reservation);
                    }
                }
                Undo::Update(prior) => self.replace_record(prior)?,
                Undo::CheckIn { prior, record_id } => {
                    self.check_ins.remove(&prior.id);
                    self.replace_record(prior)?;
                    self.next_check_in_id = self.next_check_in_id.min(record_id);
                }
                Undo::AddBlackout(blackout) => {
                    self.blackouts.remove(&blackout.id);
                    remove_from_slot(&mut self.blackouts_by_slot, blackout.slot(), &blackout.id);
                    self.next_blackout_id = self.next_blackout_id.min(blackout.id);
                }
                Undo::RemoveBlackout(blackout) => {
                    self.apply_op(Op::AddBlackout { blackout })?;
                }
            }
        }

        self.next_op_seq = first_seq;
        Ok(())
    }

    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn bookable_resource(&self, id: ResourceId) -> Result<&Resource, BookingError> {
        let resource = self
            .resources
            .get(&id)
            .ok_or(BookingError::NotFound(Missing::Resource(id)))?;
        if !resource.active {
            return Err(BookingError::ResourceInactive(id));
        }
        Ok(resource)
    }

    fn materialize(
        &mut self,
        draft: &ReservationDraft,
        facility_id: FacilityId,
        date: NaiveDate,
        series: Option<SeriesInfo>,
    ) -> Reservation {
        let id = self.next_reservation_id;
        self.next_reservation_id += 1;
        Reservation {
            id,
            resource_id: draft.resource_id,
            facility_id,
            date,
            range: draft.range,
            status: ReservationStatus::Pending,
            payment: draft.payment,
            booked_by: draft.booked_by,
            notes: draft.notes.clone(),
            series,
            checked_in: false,
            checked_in_at: None,
        }
    }

    fn slot_records(&self, key: SlotKey) -> impl Iterator<Item = &Reservation> + '_ {
        self.by_slot
            .get(&key)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
    }

    fn slot_blackouts(&self, key: SlotKey) -> impl Iterator<Item = &Blackout> + '_ {
        self.blackouts_by_slot
            .get(&key)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.blackouts.get(id))
    }

    fn commit(&mut self, op: Op) -> Result<StoredOp, BookingError> {
        let undo = self.undo_for(&op)?;
        self.apply_op(op.clone())?;
        let stored = StoredOp {
            seq: self.take_next_op_seq(),
            ts_ms: now_ms(),
            op,
        };
        self.pending.ops.push(stored.clone());
        self.pending.undo.push(undo);
        Ok(stored)
    }

    fn undo_for(&self, op: &Op) -> Result<Undo, BookingError> {
        let prior_of = |id: ReservationId| {
            self.records
                .get(&id)
                .cloned()
                .ok_or(BookingError::NotFound(Missing::Reservation(id)))
        };

        Ok(match op {
            Op::UpsertResource { resource } => Undo::Resource {
                id: resource.id,
                prior: self.resources.get(&resource.id).cloned(),
            },
            Op::Insert { reservations } => Undo::Insert(reservations.clone()),
            Op::Update { reservation } => Undo::Update(prior_of(reservation.id)?),
            Op::CheckIn { record, reservation } => Undo::CheckIn {
                prior: prior_of(reservation.id)?,
                record_id: record.id,
            },
            Op::AddBlackout { blackout } => Undo::AddBlackout(blackout.clone()),
            Op::RemoveBlackout { id } => Undo::RemoveBlackout(
                self.blackouts
                    .get(id)
                    .cloned()
                    .ok_or(BookingError::NotFound(Missing::Blackout(*id)))?,
            ),
        })
    }

    fn apply_op(&mut self, op: Op) -> Result<(), BookingError> {
        match op {
            Op::UpsertResource { resource } => {
                self.resources.insert(resource.id, resource);
            }
            Op::Insert { reservations } => {
                if let Some(dup) = reservations.iter().find(|r| self.records.contains_key(&r.id)) {
                    return Err(BookingError::Validation(format!(
                        "reservation {} already exists",
                        dup.id
                    )));
                }
                for reservation in reservations {
                    self.insert_record(reservation);
                }
            }
            Op::Update { reservation } => {
                self.replace_record(reservation)?;
            }
            Op::CheckIn { record, reservation } => {
                self.replace_record(reservation)?;
                self.bump_ids_for_check_in(record.id);
                self.check_ins.insert(record.reservation_id, record);
            }
            Op::AddBlackout { blackout } => {
                self.next_blackout_id = self.next_blackout_id.max(blackout.id.saturating_add(1));
                self.blackouts_by_slot
                    .entry(blackout.slot())
                    .or_default()
                    .push(blackout.id);
                self.blackouts.insert(blackout.id, blackout);
            }
            Op::RemoveBlackout { id } => {
                let blackout = self
                    .blackouts
                    .remove(&id)
                    .ok_or(BookingError::NotFound(Missing::Blackout(id)))?;
                remove_from_slot(&mut self.blackouts_by_slot, blackout.slot(), &id);
            }
        }
        Ok(())
    }

    fn insert_record(&mut self, reservation: Reservation) {
        let id = reservation.id;
        self.next_reservation_id = self.next_reservation_id.max(id.saturating_add(1));
        if let Some(series) = &reservation.series {
            self.next_series_id = self.next_series_id.max(series.series_id.saturating_add(1));
            let ids = self.by_series.entry(series.series_id).or_default();
            let at = ids
                .iter()
                .position(|other| {
                    self.records
                        .get(other)
                        .and_then(|r| r.series.as_ref())
                        .is_some_and(|s| s.position > series.position)
                })
                .unwrap_or(ids.len());
            ids.insert(at, id);
        }
        self.by_slot.entry(reservation.slot()).or_default().push(id);
        self.order.push(id);
        self.records.insert(id, reservation);
    }

    fn remove_record(&mut self, reservation: &Reservation) {
        let id = reservation.id;
        self.records.remove(&id);
        if let Some(pos) = self.order.iter().rposition(|other| *other == id) {
            self.order.remove(pos);
        }
        remove_from_slot(&mut self.by_slot, reservation.slot(), &id);
        if let Some(series) = &reservation.series {
            if let Some(ids) = self.by_series.get_mut(&series.series_id) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_series.remove(&series.series_id);
                }
            }
            self.next_series_id = self.next_series_id.min(series.series_id);
        }
        self.next_reservation_id = self.next_reservation_id.min(id);
    }

    fn replace_record(&mut self, reservation: Reservation) -> Result<(), BookingError> {
        let id = reservation.id;
        let old_slot = self
            .records
            .get(&id)
            .ok_or(BookingError::NotFound(Missing::Reservation(id)))?
            .slot();
        let new_slot = reservation.slot();
        if old_slot != new_slot {
            remove_from_slot(&mut self.by_slot, old_slot, &id);
            self.by_slot.entry(new_slot).or_default().push(id);
        }
        self.records.insert(id, reservation);
        Ok(())
    }

    fn bump_ids_for_check_in(&mut self, id: CheckInId) {
        self.next_check_in_id = self.next_check_in_id.max(id.saturating_add(1));
    }

    fn take_next_op_seq(&mut self) -> OpSeq {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
