//! PostgreSQL connection helpers.

use std::error::Error as _;

use postgres::error::SqlState;
use postgres::{Client, NoTls};

/// Builds a libpq-style connection string from the standard environment:
/// `PGHOST` (default `localhost`), `PGPORT` (default `5432`), `PGUSER`
/// (default `$USER`), `PGPASSWORD` (optional), `PGDATABASE` (default: user).
///
/// Returns `None` if neither `PGUSER` nor `USER` is set.
pub fn connection_string_from_env() -> Option<String> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .ok()?;
    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let password = std::env::var("PGPASSWORD").unwrap_or_default();
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

    Some(build_connection_string(
        &host, &port, &user, &password, &database,
    ))
}

fn build_connection_string(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    database: &str,
) -> String {
    if password.is_empty() {
        format!(
            "host={} port={} user={} dbname={}",
            host, port, user, database
        )
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    }
}

/// Opens a plain-text connection, rendering failures with [`describe_pg_error`].
pub fn connect(connection_string: &str) -> Result<Client, String> {
    Client::connect(connection_string, NoTls).map_err(|e| describe_pg_error(&e))
}

/// Renders a client error for logs. Server errors carry their SQLSTATE;
/// transport errors are reduced to their cause.
pub fn describe_pg_error(e: &postgres::Error) -> String {
    if let Some(db) = e.as_db_error() {
        return render_db_error(db.severity(), db.code(), db.message());
    }
    let refused = e
        .source()
        .and_then(|s| s.downcast_ref::<std::io::Error>())
        .is_some_and(|io| io.kind() == std::io::ErrorKind::ConnectionRefused);
    if refused {
        "connection refused".to_string()
    } else {
        e.to_string()
    }
}

/// True when the server rejected the call for lack of privileges.
pub(crate) fn is_permission_denied(e: &postgres::Error) -> bool {
    e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE)
}

fn render_db_error(severity: &str, code: &SqlState, message: &str) -> String {
    if *code == SqlState::INSUFFICIENT_PRIVILEGE {
        format!("{message} (needs superuser or pg_read_server_files)")
    } else {
        format!("{severity} {}: {message}", code.code())
    }
}

/// Execute `SHOW <setting>` and return the value.
pub(crate) fn show_setting(client: &mut Client, name: &str) -> Option<String> {
    let query = format!("SHOW {}", name);
    client
        .query_one(&query as &str, &[])
        .ok()
        .and_then(|row| row.try_get::<_, String>(0).ok())
}
