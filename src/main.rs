use bookpay::config::Settings;
use bookpay::domain::fees;
use bookpay::domain::gateway::PaymentGateway;
use bookpay::domain::money::round_money;
use bookpay::domain::ports::{BookingStoreRef, PaymentStoreRef};
use bookpay::infrastructure::gateways::{build_registry, sandbox::SandboxGateway};
use bookpay::infrastructure::in_memory::{InMemoryBookingStore, InMemoryPaymentStore};
#[cfg(feature = "storage-rocksdb")]
use bookpay::infrastructure::rocksdb::RocksDBStore;
use bookpay::interfaces::csv::replay_reader::ReplayReader;
use bookpay::interfaces::csv::report_writer::ReportWriter;
use bookpay::interfaces::replay::ReplayRunner;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a CSV operation log through the sandbox provider
    Replay {
        /// Input operations CSV file
        input: PathBuf,

        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Instant of minute 0 (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },
    /// Fee breakdown for a booking base amount
    Fees {
        #[arg(long)]
        base: Decimal,

        #[arg(long, default_value = "sandbox")]
        gateway: PaymentGateway,
    },
    /// Refund owed for a cancellation some hours before the service
    RefundQuote {
        #[arg(long)]
        amount: Decimal,

        #[arg(long)]
        hours: Decimal,
    },
    /// Failed payments whose retry is due
    DueRetries {
        #[arg(long)]
        db_path: PathBuf,

        /// Evaluation instant (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

#[derive(Serialize)]
struct FeeQuote {
    gateway: PaymentGateway,
    base_amount: Decimal,
    platform_fee: Decimal,
    total_amount: Decimal,
    gateway_fee: Decimal,
    total_fees: Decimal,
    net_amount: Decimal,
}

#[derive(Serialize)]
struct RefundQuote {
    amount: Decimal,
    hours_until_service: Decimal,
    refund_percentage: Decimal,
    refund_amount: Decimal,
}

#[derive(Serialize)]
struct DueRetry {
    payment_id: String,
    transaction_id: String,
    booking_id: String,
    attempts: u32,
    next_retry_at: String,
}

fn open_stores(db_path: Option<PathBuf>) -> Result<(BookingStoreRef, PaymentStoreRef)> {
    #[cfg(feature = "storage-rocksdb")]
    {
        if let Some(path) = db_path {
            let store = RocksDBStore::open(&path).into_diagnostic()?;
            info!(path = %path.display(), "using RocksDB storage");
            let bookings: BookingStoreRef = Arc::new(store.clone());
            let payments: PaymentStoreRef = Arc::new(store);
            return Ok((bookings, payments));
        }
    }
    #[cfg(not(feature = "storage-rocksdb"))]
    {
        if let Some(path) = db_path {
            warn!(
                path = %path.display(),
                "built without the storage-rocksdb feature; falling back to in-memory storage"
            );
        }
    }
    let bookings: BookingStoreRef = Arc::new(InMemoryBookingStore::new());
    let payments: PaymentStoreRef = Arc::new(InMemoryPaymentStore::new());
    Ok((bookings, payments))
}

fn write_csv<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<()> {
    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());
    for row in rows {
        writer.serialize(row).into_diagnostic()?;
    }
    writer.flush().into_diagnostic()
}

async fn replay(
    input: PathBuf,
    db_path: Option<PathBuf>,
    start: Option<DateTime<Utc>>,
    settings: &Settings,
) -> Result<()> {
    let (bookings, payments) = open_stores(db_path)?;
    let sandbox = Arc::new(SandboxGateway::new(settings.sandbox_webhook_secret.clone()));
    let gateways = build_registry(settings, sandbox.clone()).into_diagnostic()?;
    let mut runner = ReplayRunner::new(
        bookings,
        payments,
        gateways,
        sandbox,
        settings,
        start.unwrap_or_else(Utc::now),
    );

    let file = File::open(input).into_diagnostic()?;
    for (index, record) in ReplayReader::new(file).records().enumerate() {
        let line = index + 2;
        match record {
            Ok(record) => {
                if let Err(err) = runner.apply(&record).await {
                    warn!(
                        line,
                        op = ?record.op,
                        booking = %record.booking,
                        error = %err,
                        "row rejected"
                    );
                }
            }
            Err(err) => warn!(line, error = %err, "unreadable row skipped"),
        }
    }

    let rows = runner.report().await.into_diagnostic()?;
    let stdout = io::stdout();
    ReportWriter::new(stdout.lock())
        .write_rows(rows)
        .into_diagnostic()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().into_diagnostic()?;

    match cli.command {
        Command::Replay {
            input,
            db_path,
            start,
        } => replay(input, db_path, start, &settings).await,
        Command::Fees { base, gateway } => {
            let platform_fee = fees::platform_fee(base);
            let total_amount = base + platform_fee;
            let breakdown = fees::compute_fees(
                base,
                total_amount,
                gateway,
                settings.payment.processing_fee,
            )
            .rounded();
            write_csv([FeeQuote {
                gateway,
                base_amount: round_money(base),
                platform_fee: breakdown.platform_fee,
                total_amount: round_money(total_amount),
                gateway_fee: breakdown.gateway_fee,
                total_fees: breakdown.total_fees,
                net_amount: round_money(fees::net_amount(total_amount, &breakdown.components())),
            }])
        }
        Command::RefundQuote { amount, hours } => write_csv([RefundQuote {
            amount: round_money(amount),
            hours_until_service: hours,
            refund_percentage: fees::refund_percentage(hours),
            refund_amount: round_money(fees::refund_amount(amount, hours)),
        }]),
        Command::DueRetries { db_path, at } => {
            let (_, payments) = open_stores(Some(db_path))?;
            let due = payments
                .due_for_retry(at.unwrap_or_else(Utc::now))
                .await
                .into_diagnostic()?;
            info!(count = due.len(), "payments due for retry");
            write_csv(due.into_iter().map(|payment| DueRetry {
                payment_id: payment.id.to_string(),
                transaction_id: payment.transaction_id,
                booking_id: payment.booking_id.to_string(),
                attempts: payment.attempts,
                next_retry_at: payment
                    .next_retry_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
            }))
        }
    }
}
