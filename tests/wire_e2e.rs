use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use gymbook::auth::Credentials;
use gymbook::config::BookingRules;
use gymbook::directory::{StaticDirectory, StaticEntitlements};
use gymbook::engine::{now_ms, Engine};
use gymbook::wire;

const H: i64 = 3_600_000;
const DAY: i64 = 24 * H;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("gymbook_int_test_{}", Ulid::new()));
    let engine = Arc::new(
        Engine::open(
            &dir.join("gymbook.wal"),
            BookingRules::default(),
            Arc::new(StaticDirectory::permissive()),
            Arc::new(StaticEntitlements::unlimited()),
        )
        .await
        .unwrap(),
    );

    let credentials = Arc::new(Credentials::shared("gymbook").with_logins("kiosk:kiosk-pw").unwrap());
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let (engine, credentials) = (engine.clone(), credentials.clone());
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, credentials).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("gym")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "frontdesk", "gymbook").await.unwrap()
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Midnight UTC a few days out, so lead-time rules never interfere.
fn day() -> i64 {
    (now_ms() / DAY + 5) * DAY
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn session_booking_and_trainer_conflict() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (user, trainer) = (Ulid::new(), Ulid::new());
    let d = day();
    let (s, e) = (d + 10 * H, d + 11 * H);

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end", notes) VALUES ('{}', '{user}', '{trainer}', {s}, {e}, 'first session')"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM bookings WHERE user_id = '{user}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("confirmed"));
    assert_eq!(rows[0].get("notes"), Some("first session"));
    assert_eq!(rows[0].get("class_id"), None);

    let clash = format!(
        r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{}', '{trainer}', {}, {})"#,
        Ulid::new(),
        Ulid::new(),
        s + H / 2,
        e + H / 2
    );
    assert_eq!(sqlstate(&client, &clash).await, "23P01");

    let back_to_back = format!(
        r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{}', '{trainer}', {e}, {})"#,
        Ulid::new(),
        Ulid::new(),
        e + H
    );
    client.batch_execute(&back_to_back).await.unwrap();
    let rows = select(&client, &format!("SELECT * FROM bookings WHERE trainer_id = '{trainer}'")).await;
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn class_fills_up_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (class, trainer) = (Ulid::new(), Ulid::new());
    let d = day();

    client
        .batch_execute(&format!(
            r#"INSERT INTO classes (id, trainer_id, name, start, "end", capacity, category) VALUES ('{class}', '{trainer}', 'Spin', {}, {}, 1, 'cardio')"#,
            d + 7 * H,
            d + 8 * H
        ))
        .await
        .unwrap();

    let (first, second) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, user_id, class_id) VALUES ('{first}', '{}', '{class}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    let full = format!(
        "INSERT INTO bookings (id, user_id, class_id) VALUES ('{second}', '{}', '{class}')",
        Ulid::new()
    );
    assert_eq!(sqlstate(&client, &full).await, "53000");

    let rows = select(&client, &format!("SELECT * FROM classes WHERE id = '{class}'")).await;
    assert_eq!(rows[0].get("participants"), Some("1"));
    assert_eq!(rows[0].get("remaining"), Some("0"));
    assert_eq!(select(&client, &format!("SELECT * FROM participants WHERE class_id = '{class}'")).await.len(), 1);

    // Class seats carry no lead time.
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{first}'"))
        .await
        .unwrap();
    client.batch_execute(&full).await.unwrap();

    let listed = select(&client, "SELECT * FROM classes WHERE category = 'cardio'").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("name"), Some("Spin"));
}

#[tokio::test]
async fn proposal_needs_approval() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (schedule, trainer, admin) = (Ulid::new(), Ulid::new(), Ulid::new());
    let d = day();

    client
        .batch_execute(&format!(
            r#"INSERT INTO proposals (id, trainer_id, name, start, "end", capacity, notes) VALUES ('{schedule}', '{trainer}', 'Core', {}, {}, 10, 'lunchtime slot')"#,
            d + 12 * H,
            d + 13 * H
        ))
        .await
        .unwrap();

    let pending = select(&client, "SELECT * FROM proposals").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].get("approval"), Some("pending"));
    assert!(select(&client, "SELECT * FROM schedules").await.is_empty());

    let early = format!(
        "INSERT INTO bookings (id, user_id, class_id) VALUES ('{}', '{}', '{schedule}')",
        Ulid::new(),
        Ulid::new()
    );
    assert_eq!(sqlstate(&client, &early).await, "55000");

    client
        .batch_execute(&format!(
            "INSERT INTO approvals (schedule_id, approved_by) VALUES ('{schedule}', '{admin}')"
        ))
        .await
        .unwrap();
    let again = format!("INSERT INTO approvals (schedule_id) VALUES ('{schedule}')");
    assert_eq!(sqlstate(&client, &again).await, "55000");

    let listed = select(&client, "SELECT * FROM schedules").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("kind"), Some("workout_schedule"));
    client.batch_execute(&early).await.unwrap();
}

#[tokio::test]
async fn late_cancellation_is_refused() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let booking = Ulid::new();
    let start = now_ms() + 10 * H;

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{booking}', '{}', '{}', {start}, {})"#,
            Ulid::new(),
            Ulid::new(),
            start + H
        ))
        .await
        .unwrap();

    let cancel = format!("INSERT INTO cancellations (booking_id, reason) VALUES ('{booking}', 'busy')");
    assert_eq!(sqlstate(&client, &cancel).await, "55000");

    client
        .batch_execute(&format!("INSERT INTO completions (booking_id) VALUES ('{booking}')"))
        .await
        .unwrap();
    let rows = select(&client, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(rows[0].get("status"), Some("completed"));
}

#[tokio::test]
async fn availability_and_conflicts() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let trainer = Ulid::new();
    let d = day();
    let date = gymbook::engine::date_of(d).unwrap();

    client
        .batch_execute(&format!(
            r#"INSERT INTO availability (trainer_id, date, start, "end") VALUES ('{trainer}', '{date}', '09:00', '12:00')"#
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{}', '{trainer}', {}, {})"#,
            Ulid::new(),
            Ulid::new(),
            d + 10 * H,
            d + 11 * H
        ))
        .await
        .unwrap();

    let outside = format!(
        r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{}', '{trainer}', {}, {})"#,
        Ulid::new(),
        Ulid::new(),
        d + 14 * H,
        d + 15 * H
    );
    assert_eq!(sqlstate(&client, &outside).await, "23514");

    let free = select(
        &client,
        &format!(
            r#"SELECT * FROM availability WHERE trainer_id = '{trainer}' AND start >= {d} AND "end" <= {}"#,
            d + DAY
        ),
    )
    .await;
    let starts: Vec<i64> = free
        .iter()
        .map(|r| r.get("start").unwrap().parse().unwrap())
        .collect();
    assert_eq!(starts, vec![d + 9 * H, d + 11 * H]);

    let conflicts = select(
        &client,
        &format!(
            r#"SELECT * FROM conflicts WHERE trainer_id = '{trainer}' AND start >= {d} AND "end" <= {}"#,
            d + DAY
        ),
    )
    .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get("kind"), Some("session"));
}

#[tokio::test]
async fn entitlements_and_errors() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let rows = select(&client, &format!("SELECT * FROM entitlements WHERE user_id = '{}'", Ulid::new())).await;
    assert_eq!(rows[0].get("plan"), Some("unlimited"));
    assert_eq!(rows[0].get("remaining"), None);

    assert_eq!(sqlstate(&client, "SELECT * FROM gyms").await, "42601");
    assert_eq!(sqlstate(&client, "UPDATE bookings SET status = 'x'").await, "42601");
    let missing = format!("INSERT INTO completions (booking_id) VALUES ('{}')", Ulid::new());
    assert_eq!(sqlstate(&client, &missing).await, "P0002");
    let inverted = format!(
        r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{}', '{}', {}, {})"#,
        Ulid::new(),
        Ulid::new(),
        Ulid::new(),
        day() + 2 * H,
        day() + H
    );
    assert_eq!(sqlstate(&client, &inverted).await, "22023");
}

#[tokio::test]
async fn class_reschedule_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (class, trainer, member) = (Ulid::new(), Ulid::new(), Ulid::new());
    let d = day();

    client
        .batch_execute(&format!(
            r#"INSERT INTO classes (id, trainer_id, name, start, "end", capacity) VALUES ('{class}', '{trainer}', 'Yoga', {}, {}, 5)"#,
            d + 9 * H,
            d + 10 * H
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, user_id, class_id) VALUES ('{}', '{member}', '{class}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, user_id, trainer_id, start, "end") VALUES ('{}', '{member}', '{}', {}, {})"#,
            Ulid::new(),
            Ulid::new(),
            d + 14 * H,
            d + 15 * H
        ))
        .await
        .unwrap();

    let clash = format!(
        r#"INSERT INTO class_reschedules (class_id, start, "end") VALUES ('{class}', {}, {})"#,
        d + 14 * H,
        d + 15 * H
    );
    assert_eq!(sqlstate(&client, &clash).await, "23P01");

    client
        .batch_execute(&format!(
            r#"INSERT INTO class_reschedules (class_id, start, "end") VALUES ('{class}', {}, {})"#,
            d + 16 * H,
            d + 17 * H
        ))
        .await
        .unwrap();
    let rows = select(&client, &format!("SELECT * FROM classes WHERE id = '{class}'")).await;
    let start = (d + 16 * H).to_string();
    assert_eq!(rows[0].get("start"), Some(start.as_str()));
    assert_eq!(rows[0].get("participants"), Some("1"));
}

#[tokio::test]
async fn named_logins_use_their_own_password() {
    let addr = start_test_server().await;

    assert!(connect_as(addr, "kiosk", "gymbook").await.is_err());
    assert!(connect_as(addr, "frontdesk", "wrong").await.is_err());

    let kiosk = connect_as(addr, "kiosk", "kiosk-pw").await.unwrap();
    let rows = select(&kiosk, &format!("SELECT * FROM entitlements WHERE user_id = '{}'", Ulid::new())).await;
    assert_eq!(rows.len(), 1);
}
