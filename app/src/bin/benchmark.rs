//! Page-fetch benchmark against a seeded MySQL table.
//!
//! Measures what the interactive client actually feels: time to the first
//! page, sustained paging throughput, and the bounded-count latency.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use trellis_adapters::mysql::{MysqlConnectionBackend, MysqlTableBackend};
use trellis_core::connection::ConnectionManager;
use trellis_core::page_loader::PageBackend;
use trellis_core::profiles::ConnectionProfile;
use trellis_core::query_spec::{QuerySpec, SortKey};
use trellis_core::schema_catalog::SchemaBackend;

#[derive(Debug, Clone)]
struct BenchmarkConfig {
    host: String,
    port: u16,
    user: String,
    database: String,
    seed_rows: u64,
    page_size: usize,
    pages: u64,
    assert_first_page_ms: Option<f64>,
    assert_min_rows_per_sec: Option<f64>,
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

impl BenchmarkConfig {
    fn from_env() -> Self {
        Self {
            host: std::env::var("TRELLIS_BENCH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_number("TRELLIS_BENCH_PORT").unwrap_or(3306),
            user: std::env::var("TRELLIS_BENCH_USER").unwrap_or_else(|_| "root".to_string()),
            database: std::env::var("TRELLIS_BENCH_DATABASE")
                .unwrap_or_else(|_| "trellis_bench".to_string()),
            seed_rows: env_number("TRELLIS_BENCH_SEED_ROWS").unwrap_or(100_000),
            page_size: env_number("TRELLIS_BENCH_PAGE_SIZE").unwrap_or(500),
            pages: env_number("TRELLIS_BENCH_PAGES").unwrap_or(40),
            assert_first_page_ms: env_number("TRELLIS_BENCH_ASSERT_FIRST_PAGE_MS"),
            assert_min_rows_per_sec: env_number("TRELLIS_BENCH_ASSERT_MIN_ROWS_PER_SEC"),
        }
    }

    fn profile(&self) -> ConnectionProfile {
        let mut profile = ConnectionProfile::new("bench-local", self.host.clone(), self.user.clone());
        profile.port = self.port;
        profile.database = Some(self.database.clone());
        profile
    }
}

#[derive(Debug, Clone)]
struct PagingMetrics {
    first_page: Duration,
    rows_fetched: u64,
    elapsed: Duration,
    count_latency: Duration,
}

fn io_other(error: impl ToString) -> io::Error {
    io::Error::other(error.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BenchmarkConfig::from_env();
    let profile = config.profile();

    let mut manager = ConnectionManager::new(MysqlConnectionBackend);
    let connect_latency = manager.connect(profile.clone()).await.map_err(io_other)?;

    let backend = MysqlTableBackend::from_profile(&profile);
    ensure_seed_data(&config).await?;

    let metrics = run_paging_benchmark(&backend, &config).await?;
    let rows_per_sec = if metrics.elapsed.as_secs_f64() > 0.0 {
        metrics.rows_fetched as f64 / metrics.elapsed.as_secs_f64()
    } else {
        0.0
    };
    let first_page_ms = metrics.first_page.as_secs_f64() * 1_000.0;

    println!(
        "metric.connect_ms={:.3}",
        connect_latency.as_secs_f64() * 1_000.0
    );
    println!("metric.first_page_ms={first_page_ms:.3}");
    println!("metric.rows_fetched={}", metrics.rows_fetched);
    println!(
        "metric.paging_elapsed_ms={:.3}",
        metrics.elapsed.as_secs_f64() * 1_000.0
    );
    println!("metric.rows_per_sec={rows_per_sec:.3}");
    println!(
        "metric.bounded_count_ms={:.3}",
        metrics.count_latency.as_secs_f64() * 1_000.0
    );
    println!(
        "summary={}",
        json!({
            "first_page_ms": first_page_ms,
            "rows_fetched": metrics.rows_fetched,
            "rows_per_sec": rows_per_sec,
        })
    );

    if let Some(limit) = config.assert_first_page_ms {
        if first_page_ms > limit {
            return Err(io_other(format!(
                "first page took {first_page_ms:.3}ms, limit {limit:.3}ms"
            ))
            .into());
        }
    }
    if let Some(floor) = config.assert_min_rows_per_sec {
        if rows_per_sec < floor {
            return Err(io_other(format!(
                "throughput {rows_per_sec:.3} rows/s under floor {floor:.3}"
            ))
            .into());
        }
    }

    manager.disconnect().await.map_err(io_other)?;
    backend.disconnect().await.map_err(io_other)?;

    Ok(())
}

async fn run_paging_benchmark(
    backend: &MysqlTableBackend,
    config: &BenchmarkConfig,
) -> io::Result<PagingMetrics> {
    let spec = QuerySpec::for_table(Some(config.database.clone()), "events")
        .with_sort(vec![SortKey::ascending("id")]);

    let catalog = backend.fetch_catalog().await.map_err(io_other)?;
    let schema = catalog
        .database(&config.database)
        .and_then(|db| db.tables.iter().find(|table| table.name == "events"))
        .map(|table| Arc::clone(&table.schema))
        .ok_or_else(|| io_other("events table missing after seeding"))?;

    let started_at = Instant::now();
    let mut rows_fetched = 0_u64;
    let mut first_page = None;

    for page_index in 0..config.pages {
        let offset = page_index * config.page_size as u64;
        let page = backend
            .fetch_page(&spec, Arc::clone(&schema), offset, config.page_size)
            .await
            .map_err(io_other)?;
        rows_fetched += page.len() as u64;
        if first_page.is_none() {
            first_page = Some(started_at.elapsed());
        }
        if page.len() < config.page_size {
            break;
        }
    }
    let elapsed = started_at.elapsed();

    let count_started = Instant::now();
    backend
        .count_rows(&spec, config.seed_rows)
        .await
        .map_err(io_other)?;
    let count_latency = count_started.elapsed();

    Ok(PagingMetrics {
        first_page: first_page.unwrap_or_default(),
        rows_fetched,
        elapsed,
        count_latency,
    })
}

async fn ensure_seed_data(config: &BenchmarkConfig) -> io::Result<()> {
    let mut admin_profile = config.profile();
    admin_profile.database = None;
    let admin = MysqlTableBackend::from_profile(&admin_profile);

    admin
        .execute_raw(&format!(
            "CREATE DATABASE IF NOT EXISTS `{}`",
            config.database
        ))
        .await
        .map_err(io_other)?;
    admin
        .execute_raw(&format!(
            "CREATE TABLE IF NOT EXISTS `{}`.`events` (\
             id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,\
             user_id INT NOT NULL,\
             category VARCHAR(32) NOT NULL,\
             payload VARCHAR(128) NOT NULL)",
            config.database
        ))
        .await
        .map_err(io_other)?;

    let spec = QuerySpec::for_table(Some(config.database.clone()), "events");
    let existing = admin
        .count_rows(&spec, config.seed_rows)
        .await
        .map_err(io_other)?;
    // An inexact count means the table already holds more than the target.
    let mut next = if existing.exact { existing.total + 1 } else { config.seed_rows + 1 };

    while next <= config.seed_rows {
        let end = (next + 999).min(config.seed_rows);
        admin
            .execute_raw(&build_insert_batch_sql(&config.database, next, end))
            .await
            .map_err(io_other)?;
        next = end + 1;
    }

    admin.disconnect().await.map_err(io_other)
}

fn build_insert_batch_sql(database: &str, start: u64, end: u64) -> String {
    let mut values = Vec::with_capacity((end - start + 1) as usize);
    for index in start..=end {
        let user_id = (index % 5_000) + 1;
        let category = match index % 5 {
            0 => "search",
            1 => "play",
            2 => "pause",
            3 => "skip",
            _ => "share",
        };
        values.push(format!("({user_id}, '{category}', 'payload-{index}')"));
    }

    format!(
        "INSERT INTO `{database}`.`events` (user_id, category, payload) VALUES {}",
        values.join(",")
    )
}
