//! JSON-lines frontend: one request object per line, one response per line.
//!
//! The first frame must be `login` with the shared password and the caller's
//! identity as asserted by the upstream identity provider. Every later frame
//! runs under that identity. Lines carrying a `push` key are notifications,
//! not responses.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{Action, Identity};
use crate::engine::{BookingError, Engine, PaymentSubmission, ReservationRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::{InAppHub, Notification};

type Lines<S> = Framed<S, LinesCodec>;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Login {
        password: String,
        identity: Identity,
    },
    CreateReservation {
        #[serde(default)]
        unit_id: Option<Ulid>,
        #[serde(default)]
        start_date: Option<String>,
        #[serde(default)]
        rental_type: Option<String>,
    },
    SubmitPayment {
        reservation_id: Ulid,
        amount: Amount,
        slip_ref: String,
        #[serde(default)]
        ocr: Option<OcrHint>,
    },
    VerifyPayment {
        payment_id: Ulid,
        decision: Decision,
        #[serde(default)]
        reason: Option<String>,
    },
    CancelReservation {
        reservation_id: Ulid,
    },
    RegisterUnit {
        #[serde(default)]
        unit_id: Option<Ulid>,
        zone_id: Ulid,
        lock_number: String,
        rates: Rates,
    },
    SetMaintenance {
        unit_id: Ulid,
        on: bool,
    },
    PromoteQueue {
        unit_id: Ulid,
    },
    MyReservations,
    PendingPayments,
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::CreateReservation { .. } => "create_reservation",
            Request::SubmitPayment { .. } => "submit_payment",
            Request::VerifyPayment { .. } => "verify_payment",
            Request::CancelReservation { .. } => "cancel_reservation",
            Request::RegisterUnit { .. } => "register_unit",
            Request::SetMaintenance { .. } => "set_maintenance",
            Request::PromoteQueue { .. } => "promote_queue",
            Request::MyReservations => "my_reservations",
            Request::PendingPayments => "pending_payments",
        }
    }
}

fn ok_response(body: Value) -> Value {
    match body {
        Value::Object(mut map) => {
            map.insert("ok".into(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => json!({ "ok": true }),
        other => json!({ "ok": true, "result": other }),
    }
}

fn error_response(code: &str, message: impl std::fmt::Display, status: u16) -> Value {
    json!({
        "ok": false,
        "code": code,
        "message": message.to_string(),
        "status": status,
    })
}

fn booking_error_response(e: &BookingError) -> Value {
    error_response(e.code(), e, e.status())
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, BookingError> {
    serde_json::to_value(value).map_err(|e| BookingError::Transient(e.to_string()))
}

async fn send<S>(lines: &mut Lines<S>, response: &Value) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    lines.send(response.to_string()).await
}

/// Serve one client until it disconnects.
///
/// After login the session is subscribed to the caller's in-app feed and
/// notifications are pushed between responses as `{"push": kind, ...}`.
pub async fn process_connection<S>(
    socket: S,
    engine: Arc<Engine>,
    hub: Arc<InAppHub>,
    password: String,
) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(identity) = authenticate(&mut lines, &password).await? else {
        return Ok(());
    };
    debug!("session opened for {} ({:?})", identity.user_id, identity.role);

    let feed = hub.subscribe(identity.user_id);
    let result = serve_session(&mut lines, &engine, &hub, &identity, feed).await;
    hub.release(&identity.user_id);
    result
}

async fn serve_session<S>(
    lines: &mut Lines<S>,
    engine: &Engine,
    hub: &InAppHub,
    identity: &Identity,
    mut feed: broadcast::Receiver<Notification>,
) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = lines.next() => {
                let response = match frame {
                    None => return Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(engine, identity, &line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        error_response("line_too_long", "request line too long", 400)
                    }
                    Some(Err(e)) => return Err(e),
                };
                send(lines, &response).await?;
            }
            pushed = feed.recv() => match pushed {
                Ok(notification) => send(lines, &push_frame(&notification)).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("session for {} skipped {skipped} notifications", identity.user_id);
                }
                Err(RecvError::Closed) => feed = hub.subscribe(identity.user_id),
            },
        }
    }
}

async fn handle_line(engine: &Engine, identity: &Identity, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "400").increment(1);
            return error_response("bad_request", e, 400);
        }
    };

    let op = request.op();
    match dispatch(engine, identity, request).await {
        Ok(body) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => "200").increment(1);
            ok_response(body)
        }
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => e.status().to_string())
                .increment(1);
            booking_error_response(&e)
        }
    }
}

fn push_frame(notification: &Notification) -> Value {
    json!({
        "push": notification.kind,
        "payload": notification.payload,
    })
}

/// Read the login frame. `None` means the client was refused or left.
async fn authenticate<S>(lines: &mut Lines<S>, password: &str) -> Result<Option<Identity>, LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(first) = lines.next().await else {
        return Ok(None);
    };
    let first = first?;
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Login { password: given, identity }) if given == password => {
            send(lines, &json!({ "ok": true, "user_id": identity.user_id })).await?;
            Ok(Some(identity))
        }
        Ok(Request::Login { identity, .. }) => {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!("login refused for {}", identity.user_id);
            send(lines, &error_response("auth_failed", "password authentication failed", 401)).await?;
            Ok(None)
        }
        Ok(_) | Err(_) => {
            send(lines, &error_response("login_required", "first request must be login", 401)).await?;
            Ok(None)
        }
    }
}

async fn dispatch(engine: &Engine, identity: &Identity, request: Request) -> Result<Value, BookingError> {
    match request {
        Request::Login { .. } => Err(BookingError::Forbidden),
        Request::CreateReservation { unit_id, start_date, rental_type } => {
            let request = ReservationRequest { unit_id, start_date, rental_type };
            let outcome = engine.create_reservation(identity, &request).await?;
            to_body(&outcome)
        }
        Request::SubmitPayment { reservation_id, amount, slip_ref, ocr } => {
            let submission = PaymentSubmission { reservation_id, amount, slip_ref, ocr };
            let payment = engine.submit_payment(identity, submission).await?;
            Ok(json!({ "payment": to_body(&payment)? }))
        }
        Request::VerifyPayment { payment_id, decision, reason } => {
            engine.verify_payment(identity, payment_id, decision, reason).await?;
            Ok(Value::Null)
        }
        Request::CancelReservation { reservation_id } => {
            engine.cancel_reservation(identity, reservation_id).await?;
            Ok(Value::Null)
        }
        Request::RegisterUnit { unit_id, zone_id, lock_number, rates } => {
            let id = unit_id.unwrap_or_else(Ulid::new);
            engine
                .register_unit(identity, RentalUnit::new(id, zone_id, lock_number, rates))
                .await?;
            Ok(json!({ "unit_id": id }))
        }
        Request::SetMaintenance { unit_id, on } => {
            engine.set_maintenance(identity, unit_id, on).await?;
            Ok(Value::Null)
        }
        Request::PromoteQueue { unit_id } => {
            let promoted = engine.promote_queue(identity, unit_id).await?;
            Ok(json!({ "promoted": promoted }))
        }
        Request::MyReservations => {
            let reservations = engine.reservations_for_user(identity.user_id).await;
            Ok(json!({ "reservations": to_body(&reservations)? }))
        }
        Request::PendingPayments => {
            if !identity.can(Action::ManagePayments) {
                return Err(BookingError::Forbidden);
            }
            let payments = engine.payments_by_status(PaymentStatus::Pending).await;
            Ok(json!({ "payments": to_body(&payments)? }))
        }
    }
}
