use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::auth::{Action, Identity};
use crate::limits::{MAX_REASON_LEN, MAX_SLIP_REF_LEN};
use crate::model::*;
use crate::notify::NotificationKind;

use super::{BookingError, Engine};

/// Slip upload for a reservation awaiting payment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PaymentSubmission {
    pub reservation_id: Ulid,
    pub amount: Amount,
    pub slip_ref: String,
    #[serde(default)]
    pub ocr: Option<OcrHint>,
}

impl Engine {
    /// Attach a payment slip and move the reservation to verification.
    /// A previously rejected payment is resubmitted in place.
    pub async fn submit_payment(
        &self,
        identity: &Identity,
        submission: PaymentSubmission,
    ) -> Result<Payment, BookingError> {
        if submission.slip_ref.trim().is_empty() {
            return Err(BookingError::MissingField("slip_ref"));
        }
        if submission.slip_ref.len() > MAX_SLIP_REF_LEN {
            return Err(BookingError::LimitExceeded("slip reference too long"));
        }
        let reservation_id = submission.reservation_id;
        let not_found = || BookingError::ReservationNotFound(reservation_id);
        let mut us = self.resolve_entity_write(&reservation_id, not_found).await?;

        let reservation = us
            .reservation(&reservation_id)
            .filter(|r| r.user_id == identity.user_id)
            .cloned()
            .ok_or_else(not_found)?;
        if reservation.status != ReservationStatus::PendingPayment {
            return Err(BookingError::NotAwaitingPayment(reservation.status));
        }
        let now = self.clock.now();
        if now > reservation.payment_deadline {
            return Err(BookingError::PaymentDeadlinePassed);
        }

        let payment_id = us
            .payment_for_reservation(&reservation_id)
            .map(|p| p.id)
            .unwrap_or_else(Ulid::new);
        let ocr_matches = submission
            .ocr
            .as_ref()
            .and_then(|hint| hint.amount_matches(reservation.total_amount));
        let payment = Payment {
            id: payment_id,
            reservation_id,
            user_id: identity.user_id,
            amount: submission.amount,
            slip_ref: submission.slip_ref,
            ocr: submission.ocr,
            status: PaymentStatus::Pending,
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            submitted_at: now,
        };

        let unit_id = us.unit.id;
        let events = vec![
            Event::PaymentSubmitted {
                unit_id,
                payment: payment.clone(),
            },
            Event::ReservationStatusChanged {
                id: reservation_id,
                unit_id,
                status: ReservationStatus::PendingVerification,
            },
            Event::AuditRecorded {
                unit_id,
                entry: AuditEntry::new(
                    AuditAction::PaymentSubmitted,
                    identity.user_id,
                    payment_id,
                    json!({
                        "reservation_id": reservation_id,
                        "amount": payment.amount,
                        "expected_amount": reservation.total_amount,
                        "ocr_amount_matches": ocr_matches,
                    }),
                    now,
                ),
            },
        ];
        self.commit(&mut us, events).await?;
        drop(us);

        info!("payment {payment_id} submitted for reservation {reservation_id}");
        self.notifier.send(
            identity.user_id,
            NotificationKind::PaymentUploaded,
            json!({ "reservation_id": reservation_id }),
        );
        Ok(payment)
    }

    /// Admin decision on a pending payment. Approval activates the
    /// reservation and marks the unit rented; rejection sends the
    /// reservation back to awaiting payment and leaves the unit alone.
    pub async fn verify_payment(
        &self,
        verifier: &Identity,
        payment_id: Ulid,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<(), BookingError> {
        if !verifier.can(Action::ManagePayments) {
            return Err(BookingError::Forbidden);
        }
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(BookingError::LimitExceeded("rejection reason too long"));
        }
        let not_found = || BookingError::PaymentNotFound(payment_id);
        let mut us = self.resolve_entity_write(&payment_id, not_found).await?;
        let started = std::time::Instant::now();

        let payment = us.payment(&payment_id).cloned().ok_or_else(not_found)?;
        if payment.status != PaymentStatus::Pending {
            return Err(BookingError::PaymentAlreadyVerified(payment.status));
        }
        let reservation = us
            .reservation(&payment.reservation_id)
            .cloned()
            .ok_or(BookingError::ReservationNotFound(payment.reservation_id))?;

        let now = self.clock.now();
        let unit_id = us.unit.id;
        let (payment_status, reservation_status, action) = match decision {
            Decision::Approved => (PaymentStatus::Approved, ReservationStatus::Active, AuditAction::PaymentApproved),
            Decision::Rejected => (
                PaymentStatus::Rejected,
                ReservationStatus::PendingPayment,
                AuditAction::PaymentRejected,
            ),
        };
        let rejection_reason = match decision {
            Decision::Rejected => reason,
            Decision::Approved => None,
        };

        let mut events = vec![
            Event::PaymentVerified {
                id: payment_id,
                unit_id,
                status: payment_status,
                verified_by: verifier.user_id,
                verified_at: now,
                rejection_reason: rejection_reason.clone(),
            },
            Event::ReservationStatusChanged {
                id: reservation.id,
                unit_id,
                status: reservation_status,
            },
        ];
        // Someone paid: the unit is taken, so waiting users are released.
        let mut released = Vec::new();
        if decision == Decision::Approved {
            events.push(Event::UnitStatusChanged {
                unit_id,
                status: UnitStatus::Rented,
                reserved_to: None,
                reservation_expires_at: None,
            });
            for entry in us.queue.iter().filter(|q| q.user_id != reservation.user_id) {
                released.push(entry.user_id);
            }
            events.extend(us.queue.iter().map(|q| Event::QueueLeft {
                unit_id,
                user_id: q.user_id,
            }));
        }
        events.push(Event::AuditRecorded {
            unit_id,
            entry: AuditEntry::new(
                action,
                verifier.user_id,
                payment_id,
                json!({
                    "reservation_id": reservation.id,
                    "prev_unit_status": us.unit.status.as_str(),
                    "rejection_reason": rejection_reason,
                }),
                now,
            ),
        });

        self.commit(&mut us, events).await?;
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS, "op" => "verify_payment")
            .record(started.elapsed().as_secs_f64());
        let lock_number = us.unit.lock_number.clone();
        drop(us);

        info!("payment {payment_id} {:?} by {}", decision, verifier.user_id);
        let kind = match decision {
            Decision::Approved => NotificationKind::BookingApproved,
            Decision::Rejected => NotificationKind::BookingRejected,
        };
        self.notifier.send(
            reservation.user_id,
            kind,
            json!({
                "reservation_id": reservation.id,
                "lock_number": lock_number,
                "rejection_reason": rejection_reason,
            }),
        );
        for user_id in released {
            self.notifier.send(
                user_id,
                NotificationKind::QueueCancelled,
                json!({ "lock_number": lock_number }),
            );
        }
        Ok(())
    }
}
