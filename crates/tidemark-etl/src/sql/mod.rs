//! Postgres adapters: a [`PageSource`](crate::extract::PageSource) over a
//! configured query and a [`Sink`](crate::load::Sink) over a configured
//! statement, plus connection pool setup.

pub mod sink;
pub mod source;

pub use sink::PgSink;
pub use source::PgPageSource;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::{EtlError, Result};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl DbConfig {
    /// Pool settings for `url`, sized from `DB_*` environment variables
    pub fn from_env(url: impl Into<String>) -> Self {
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let connect_timeout_secs = std::env::var("DB_CONNECT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let idle_timeout_secs = std::env::var("DB_IDLE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok());

        Self {
            url: url.into(),
            max_connections,
            min_connections,
            connect_timeout_secs,
            idle_timeout_secs,
        }
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Named parameters a configured extraction query may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryParam {
    GroupId,
    Since,
    Until,
    Limit,
}

impl QueryParam {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "group_id" => Some(Self::GroupId),
            "since" => Some(Self::Since),
            "until" => Some(Self::Until),
            "limit" => Some(Self::Limit),
            _ => None,
        }
    }
}

/// Rewrite `:name` parameters to `$n` placeholders.
///
/// Placeholders are numbered in order of first use and a repeated name
/// reuses its number. `::type` casts and quoted literals are left alone.
/// Returns the rewritten SQL and the parameters in bind order.
pub fn bind_named_params(sql: &str) -> Result<(String, Vec<QueryParam>)> {
    let mut out = String::with_capacity(sql.len());
    let mut params: Vec<QueryParam> = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            out.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if chars.peek() == Some(&':') => {
                out.push_str("::");
                chars.next();
            }
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let param = QueryParam::from_name(&name).ok_or_else(|| {
                    EtlError::config(format!(
                        "unknown query parameter ':{name}' (expected :group_id, :since, :until or :limit)"
                    ))
                })?;
                let index = match params.iter().position(|p| *p == param) {
                    Some(index) => index,
                    None => {
                        params.push(param);
                        params.len() - 1
                    }
                };
                out.push('$');
                out.push_str(&(index + 1).to_string());
            }
            _ => out.push(c),
        }
    }

    Ok((out, params))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn named_params_become_positional_in_order_of_use() {
        let (sql, params) = bind_named_params(
            "SELECT * FROM t WHERE g = :group_id AND ts > :since AND ts <= :until ORDER BY ts LIMIT :limit",
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE g = $1 AND ts > $2 AND ts <= $3 ORDER BY ts LIMIT $4");
        assert_eq!(
            params,
            vec![QueryParam::GroupId, QueryParam::Since, QueryParam::Until, QueryParam::Limit]
        );
    }

    #[test]
    fn repeated_params_share_a_placeholder() {
        let (sql, params) = bind_named_params("SELECT :since AS a, :until AS b, :since AS c").unwrap();
        assert_eq!(sql, "SELECT $1 AS a, $2 AS b, $1 AS c");
        assert_eq!(params, vec![QueryParam::Since, QueryParam::Until]);
    }

    #[test]
    fn casts_and_literals_are_untouched() {
        let (sql, params) =
            bind_named_params("SELECT ts::timestamptz, ':since' AS label FROM t WHERE ts > :since::timestamptz")
                .unwrap();
        assert_eq!(sql, "SELECT ts::timestamptz, ':since' AS label FROM t WHERE ts > $1::timestamptz");
        assert_eq!(params, vec![QueryParam::Since]);
    }

    #[test]
    fn unknown_params_are_rejected() {
        let err = bind_named_params("SELECT * FROM t WHERE x = :build").unwrap_err();
        assert!(err.to_string().contains(":build"), "got: {err}");
    }
}
