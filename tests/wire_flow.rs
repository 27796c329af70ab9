use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use innkeep::calendar::{FeedFetcher, HttpFeedFetcher};
use innkeep::config::EngineConfig;
use innkeep::engine::Engine;
use innkeep::notify::NotifyHub;
use innkeep::wire;

const PASSWORD: &str = "innkeep";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("innkeep.wal"), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap(),
    );
    let fetcher: Arc<dyn FeedFetcher> = Arc::new(HttpFeedFetcher::new(Duration::from_secs(1)).unwrap());
    let factory = Arc::new(wire::InnkeepFactory::new(engine.clone(), fetcher, PASSWORD.to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory).await;
            });
        }
    });

    (addr, engine)
}

/// Connect as `user`; the login name is the caller's identity.
async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("innkeep")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn ahead(days: u64) -> NaiveDate {
    Utc::now().date_naive().checked_add_days(Days::new(days)).unwrap()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn affected(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .unwrap()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn create_property(host: &Client, mode: &str) -> Ulid {
    let id = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO properties (id, capacity, base_rate, booking_mode, cleaning_fee) \
         VALUES ('{id}', 4, 100, '{mode}', 40)"
    ))
    .await
    .unwrap();
    id
}

async fn book(
    client: &Client,
    property: Ulid,
    start: NaiveDate,
    end: NaiveDate,
    key: &str,
) -> Result<SimpleQueryRow, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            r#"INSERT INTO bookings (property_id, start, "end", guests, idempotency_key) VALUES ('{property}', '{start}', '{end}', 2, '{key}')"#
        ))
        .await?;
    Ok(rows(messages).remove(0))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_is_paid_and_blocks_the_calendar() {
    let (addr, _engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let rival = connect(addr, "rival").await;
    let payments = connect(addr, "payments").await;

    let pid = create_property(&host, "instant").await;
    let (start, end) = (ahead(30), ahead(33));

    let quote = rows(
        guest
            .simple_query(&format!(
                r#"SELECT * FROM price_quote WHERE property_id = '{pid}' AND start = '{start}' AND "end" = '{end}' AND guests = 2"#
            ))
            .await
            .unwrap(),
    )
    .remove(0);
    assert_eq!(quote.get("nights"), Some("3"));

    let booking = book(&guest, pid, start, end, "trip-1").await.unwrap();
    assert_eq!(booking.get("status"), Some("pending_payment"));
    assert_eq!(booking.get("guest"), Some("guest"));
    assert_eq!(booking.get("total"), quote.get("total"));
    let booking_id = booking.get("id").unwrap().to_string();

    // Overlapping request loses; a stay starting on checkout day does not.
    let err = book(&rival, pid, ahead(32), ahead(35), "rival-1").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
    let turnover = book(&rival, pid, end, ahead(35), "rival-2").await.unwrap();
    assert_eq!(turnover.get("status"), Some("pending_payment"));

    let paid = payments
        .simple_query(&format!(
            "INSERT INTO payments (booking_id, result, reference) VALUES ('{booking_id}', 'paid', 'ch_1')"
        ))
        .await
        .unwrap();
    assert_eq!(affected(&paid), 1);
    // The provider retries; the second delivery changes nothing.
    let again = payments
        .simple_query(&format!(
            "INSERT INTO payments (booking_id, result, reference) VALUES ('{booking_id}', 'paid', 'ch_1')"
        ))
        .await
        .unwrap();
    assert_eq!(affected(&again), 0);

    let slots = rows(
        guest
            .simple_query(&format!(
                r#"SELECT * FROM availability WHERE property_id = '{pid}' AND start >= '{start}' AND "end" <= '{end}'"#
            ))
            .await
            .unwrap(),
    );
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| s.get("status") == Some("booked")));

    let mine = rows(
        guest
            .simple_query(&format!("SELECT * FROM bookings WHERE property_id = '{pid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("status"), Some("confirmed"));

    let all = rows(
        host.simple_query(&format!("SELECT * FROM bookings WHERE property_id = '{pid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn idempotent_retry_returns_the_same_booking() {
    let (addr, _engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let pid = create_property(&host, "instant").await;

    let first = assert_ok!(book(&guest, pid, ahead(40), ahead(42), "retry-me").await);
    let second = assert_ok!(book(&guest, pid, ahead(40), ahead(42), "retry-me").await);
    assert_eq!(first.get("id"), second.get("id"));

    // Same key, different stay.
    let err = assert_err!(book(&guest, pid, ahead(44), ahead(46), "retry-me").await);
    assert_eq!(sqlstate(&err), Some("P0001"));
}

#[tokio::test]
async fn only_the_owner_approves_requests() {
    let (addr, _engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let pid = create_property(&host, "request").await;

    let booking = book(&guest, pid, ahead(20), ahead(23), "ask-1").await.unwrap();
    assert_eq!(booking.get("status"), Some("pending_approval"));
    let id = booking.get("id").unwrap();

    let err = guest
        .simple_query(&format!("INSERT INTO approvals (booking_id) VALUES ('{id}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let approved = rows(
        host.simple_query(&format!("INSERT INTO approvals (booking_id) VALUES ('{id}')"))
            .await
            .unwrap(),
    )
    .remove(0);
    assert_eq!(approved.get("status"), Some("confirmed"));
}

#[tokio::test]
async fn guests_cannot_report_their_own_payment() {
    let (addr, engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let pid = create_property(&host, "instant").await;

    let booking = book(&guest, pid, ahead(25), ahead(27), "self-pay").await.unwrap();
    let id = booking.get("id").unwrap();
    let err = guest
        .simple_query(&format!(
            "INSERT INTO payments (booking_id, result, reference) VALUES ('{id}', 'paid', 'forged')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let stored = engine.get_booking(&id.parse().unwrap()).await.unwrap();
    assert_eq!(stored.status.as_str(), "pending_payment");
    assert!(stored.payment_reference.is_none());
}

#[tokio::test]
async fn malformed_and_unknown_payments_are_acknowledged() {
    let (addr, _engine) = start_test_server().await;
    let payments = connect(addr, "payments").await;

    let malformed = payments
        .simple_query("INSERT INTO payments (booking_id, result, reference) VALUES ('not-a-ulid', 'paid', 'ch_9')")
        .await
        .unwrap();
    assert_eq!(affected(&malformed), 0);

    let unknown = payments
        .simple_query(&format!(
            "INSERT INTO payments (booking_id, result, reference) VALUES ('{}', 'paid', 'ch_9')",
            Ulid::new()
        ))
        .await
        .unwrap();
    assert_eq!(affected(&unknown), 0);
}

#[tokio::test]
async fn calendar_export_lists_bookings_and_blocks() {
    let (addr, _engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let pid = create_property(&host, "instant").await;

    let block_id = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO blocks (id, property_id, start, \"end\") VALUES ('{block_id}', '{pid}', '{}', '{}')",
        ahead(50),
        ahead(52)
    ))
    .await
    .unwrap();
    book(&guest, pid, ahead(60), ahead(62), "export-1").await.unwrap();

    let row = rows(
        guest
            .simple_query(&format!("SELECT * FROM calendar WHERE property_id = '{pid}'"))
            .await
            .unwrap(),
    )
    .remove(0);
    let ics = row.get("ics").unwrap();
    assert!(ics.starts_with("BEGIN:VCALENDAR"));
    assert_eq!(ics.matches("BEGIN:VEVENT").count(), 2);
    assert!(ics.contains(&format!("DTSTART;VALUE=DATE:{}", ahead(60).format("%Y%m%d"))));

    // Blocked nights refuse bookings with a conflict.
    let err = book(&guest, pid, ahead(51), ahead(53), "export-2").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn deleting_a_booked_property_deactivates_it() {
    let (addr, engine) = start_test_server().await;
    let host = connect(addr, "host").await;
    let guest = connect(addr, "guest").await;
    let pid = create_property(&host, "instant").await;
    book(&guest, pid, ahead(10), ahead(12), "keep-history").await.unwrap();

    let err = guest
        .simple_query(&format!("DELETE FROM properties WHERE id = '{pid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    assert_ok!(host.batch_execute(&format!("DELETE FROM properties WHERE id = '{pid}'")).await);
    let property = engine.get_property(&pid).await.unwrap();
    assert!(!property.active);

    let err = book(&guest, pid, ahead(20), ahead(22), "too-late").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));
}

#[tokio::test]
async fn bad_sql_is_a_syntax_error() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr, "someone").await;

    let err = client.simple_query("SELEKT nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
    let err = client
        .simple_query(&format!(
            r#"SELECT * FROM availability WHERE property_id = '{}' AND start >= '2027-01-05' AND "end" <= '2027-01-01'"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22008"));
}
