use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use stallbook::clock::SystemClock;
use stallbook::engine::Engine;
use stallbook::limits::Policy;
use stallbook::notify::{InAppHub, Notifier};
use stallbook::wire;

const PASSWORD: &str = "stallbook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("stallbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let hub = Arc::new(InAppHub::new());
    let notifier = Notifier::spawn(hub.clone());
    let engine = Arc::new(
        Engine::new(dir.join("stallbook.wal"), notifier, Arc::new(SystemClock), Policy::default()).unwrap(),
    );

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub, PASSWORD.to_string()).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
    /// Notifications that arrived while waiting for a response.
    pushes: VecDeque<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self { lines: Framed::new(socket, LinesCodec::new()), pushes: VecDeque::new() }
    }

    async fn login(addr: SocketAddr, role: &str) -> (Self, Ulid) {
        let mut client = Self::connect(addr).await;
        let user_id = Ulid::new();
        let response = client
            .call(json!({
                "op": "login",
                "password": PASSWORD,
                "identity": { "user_id": user_id, "role": role },
            }))
            .await;
        assert_eq!(response["ok"], true, "login failed: {response}");
        (client, user_id)
    }

    async fn call(&mut self, request: Value) -> Value {
        self.lines.send(request.to_string()).await.unwrap();
        loop {
            let frame = self.recv().await.expect("server closed the connection");
            if frame.get("push").is_some() {
                self.pushes.push_back(frame);
            } else {
                return frame;
            }
        }
    }

    async fn next_push(&mut self) -> Option<Value> {
        if let Some(frame) = self.pushes.pop_front() {
            return Some(frame);
        }
        let frame = self.recv().await?;
        frame.get("push").is_some().then_some(frame)
    }

    async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next())
            .await
            .ok()??
            .ok()?;
        serde_json::from_str(&line).ok()
    }
}

fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

async fn register_unit(addr: SocketAddr) -> String {
    let (mut admin, _) = Client::login(addr, "admin").await;
    let response = admin
        .call(json!({
            "op": "register_unit",
            "zone_id": Ulid::new(),
            "lock_number": "A-01",
            "rates": { "daily": 100, "weekly": 600 },
        }))
        .await;
    assert_eq!(response["ok"], true, "register failed: {response}");
    response["unit_id"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let response = client
        .call(json!({
            "op": "login",
            "password": "guess",
            "identity": { "user_id": Ulid::new(), "role": "superadmin" },
        }))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["code"], "auth_failed");
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn first_frame_must_be_login() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let response = client.call(json!({ "op": "my_reservations" })).await;
    assert_eq!(response["code"], "login_required");
}

#[tokio::test]
async fn book_pay_and_approve_over_tcp() {
    let (addr, engine) = start_test_server().await;
    let unit_id = register_unit(addr).await;

    let (mut user, user_id) = Client::login(addr, "user").await;
    let booked = user
        .call(json!({
            "op": "create_reservation",
            "unit_id": unit_id,
            "start_date": today(),
            "rental_type": "weekly",
        }))
        .await;
    assert_eq!(booked["ok"], true, "booking failed: {booked}");
    assert_eq!(booked["outcome"], "confirmed");
    assert_eq!(booked["reservation"]["total_amount"], 600);
    let reservation_id = booked["reservation"]["id"].as_str().unwrap().to_string();

    let paid = user
        .call(json!({
            "op": "submit_payment",
            "reservation_id": reservation_id,
            "amount": 600,
            "slip_ref": "slips/a01.jpg",
            "ocr": { "amount": 600.0, "confidence": 92.5 },
        }))
        .await;
    assert_eq!(paid["ok"], true, "payment failed: {paid}");
    let payment_id = paid["payment"]["id"].as_str().unwrap().to_string();

    // Users may not list or verify payments.
    let denied = user.call(json!({ "op": "pending_payments" })).await;
    assert_eq!(denied["code"], "forbidden");
    assert_eq!(denied["status"], 403);

    let (mut staff, _) = Client::login(addr, "staff").await;
    let pending = staff.call(json!({ "op": "pending_payments" })).await;
    assert_eq!(pending["payments"].as_array().unwrap().len(), 1);
    let approved = staff
        .call(json!({ "op": "verify_payment", "payment_id": payment_id, "decision": "approved" }))
        .await;
    assert_eq!(approved, json!({ "ok": true }));

    let mine = user.call(json!({ "op": "my_reservations" })).await;
    assert_eq!(mine["reservations"][0]["status"], "active");
    assert_eq!(engine.reservations_for_user(user_id).await.len(), 1);
}

#[tokio::test]
async fn rule_violations_come_back_as_error_codes() {
    let (addr, _engine) = start_test_server().await;
    let unit_id = register_unit(addr).await;
    let (mut user, _) = Client::login(addr, "user").await;

    let missing = user.call(json!({ "op": "create_reservation", "unit_id": unit_id })).await;
    assert_eq!(missing["code"], "missing_field");

    let far = (Local::now().date_naive() + chrono::Days::new(30)).format("%Y-%m-%d").to_string();
    let too_far = user
        .call(json!({
            "op": "create_reservation",
            "unit_id": unit_id,
            "start_date": far,
            "rental_type": "daily",
        }))
        .await;
    assert_eq!(too_far["code"], "advance_limit_exceeded");
    assert_eq!(too_far["status"], 400);

    let garbage = user.call(json!({ "op": "launch_rockets" })).await;
    assert_eq!(garbage["code"], "bad_request");

    // The session survives errors.
    let mine = user.call(json!({ "op": "my_reservations" })).await;
    assert_eq!(mine["ok"], true);
}

#[tokio::test]
async fn session_receives_its_own_notifications() {
    let (addr, _engine) = start_test_server().await;
    let unit_id = register_unit(addr).await;
    let (mut user, _) = Client::login(addr, "user").await;
    let (mut bystander, _) = Client::login(addr, "user").await;

    let booked = user
        .call(json!({
            "op": "create_reservation",
            "unit_id": unit_id,
            "start_date": today(),
            "rental_type": "daily",
        }))
        .await;
    assert_eq!(booked["ok"], true, "booking failed: {booked}");

    let push = user.next_push().await.expect("no booking_created push");
    assert_eq!(push["push"], "booking_created");
    assert_eq!(push["payload"]["reservation_id"], booked["reservation"]["id"]);
    assert_eq!(push["payload"]["lock_number"], "A-01");

    // Other users' sessions stay quiet.
    let mine = bystander.call(json!({ "op": "my_reservations" })).await;
    assert_eq!(mine["reservations"].as_array().unwrap().len(), 0);
    assert!(bystander.pushes.is_empty());
}
