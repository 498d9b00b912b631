use crate::domain::booking::Booking;
use crate::domain::gateway::PaymentGateway;
use crate::domain::payment::Payment;
use crate::domain::ports::{BookingStore, PaymentStore};
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for booking documents keyed by booking id.
pub const CF_BOOKINGS: &str = "bookings";
/// Column Family for payment documents keyed by payment id.
pub const CF_PAYMENTS: &str = "payments";
/// Index of the single active payment per booking: booking id -> payment id.
pub const CF_ACTIVE_PAYMENTS: &str = "active_payments";
/// Index of provider transaction ids: `<gateway>:<transaction id>` -> payment id.
pub const CF_GATEWAY_TRANSACTIONS: &str = "gateway_transactions";

/// A persistent store implementation using RocksDB.
///
/// Bookings and payments live in separate Column Families next to two index
/// families. Every write takes the store's write lock, re-reads what it checks
/// and commits through one `WriteBatch`, so version checks and the
/// active-payment rule hold across concurrent callers.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

fn gateway_key(gateway: PaymentGateway, transaction_id: &str) -> Vec<u8> {
    format!("{}:{}", gateway, transaction_id).into_bytes()
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        BookpayError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to deserialize {}: {}", what, e),
        )))
    })
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        BookpayError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize {}: {}", what, e),
        )))
    })
}

fn decode_id(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| {
        BookpayError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Corrupt index entry: {}", e),
        )))
    })
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [
            CF_BOOKINGS,
            CF_PAYMENTS,
            CF_ACTIVE_PAYMENTS,
            CF_GATEWAY_TRANSACTIONS,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            BookpayError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn read<T: DeserializeOwned>(&self, family: &'static str, id: Uuid) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes, family)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: &'static str) -> Result<Vec<T>> {
        let cf = self.cf(family)?;
        let mut items = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            items.push(decode(&value, family)?);
        }
        Ok(items)
    }

    fn active_payment_for(&self, booking_id: Uuid) -> Result<Option<Uuid>> {
        let cf = self.cf(CF_ACTIVE_PAYMENTS)?;
        match self.db.get_pinned_cf(cf, booking_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stages a payment together with both of its index entries.
    fn stage_payment(&self, batch: &mut WriteBatch, payment: &Payment) -> Result<()> {
        let payments = self.cf(CF_PAYMENTS)?;
        let active = self.cf(CF_ACTIVE_PAYMENTS)?;
        let gateway_index = self.cf(CF_GATEWAY_TRANSACTIONS)?;

        batch.put_cf(payments, payment.id.as_bytes(), encode(payment, "payment")?);
        if payment.is_active() {
            batch.put_cf(active, payment.booking_id.as_bytes(), payment.id.as_bytes());
        } else if self.active_payment_for(payment.booking_id)? == Some(payment.id) {
            batch.delete_cf(active, payment.booking_id.as_bytes());
        }
        if let Some(transaction_id) = &payment.gateway_transaction_id {
            batch.put_cf(
                gateway_index,
                gateway_key(payment.payment_gateway, transaction_id),
                payment.id.as_bytes(),
            );
        }
        Ok(())
    }

    fn ensure_no_other_active(&self, payment: &Payment) -> Result<()> {
        if !payment.is_active() {
            return Ok(());
        }
        match self.active_payment_for(payment.booking_id)? {
            Some(existing) if existing != payment.id => Err(BookpayError::DuplicatePayment {
                booking_id: payment.booking_id,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BookingStore for RocksDBStore {
    async fn insert(&self, mut booking: Booking) -> Result<Booking> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(CF_BOOKINGS)?;
        if self.db.get_pinned_cf(cf, booking.id.as_bytes())?.is_some() {
            return Err(BookpayError::Conflict(format!(
                "booking {} already exists",
                booking.booking_number
            )));
        }
        booking.version = 1;
        self.db
            .put_cf(cf, booking.id.as_bytes(), encode(&booking, "booking")?)?;
        Ok(booking)
    }

    async fn update(&self, mut booking: Booking) -> Result<Booking> {
        let _guard = self.write_lock.lock().await;
        let stored: Booking = self
            .read(CF_BOOKINGS, booking.id)?
            .ok_or_else(|| BookpayError::not_found("booking", booking.id))?;
        if stored.version != booking.version {
            return Err(BookpayError::Conflict(format!(
                "booking {} was modified concurrently",
                booking.id
            )));
        }
        booking.version += 1;
        let cf = self.cf(CF_BOOKINGS)?;
        self.db
            .put_cf(cf, booking.id.as_bytes(), encode(&booking, "booking")?)?;
        Ok(booking)
    }

    async fn get(&self, booking_id: Uuid) -> Result<Option<Booking>> {
        self.read(CF_BOOKINGS, booking_id)
    }

    async fn find_by_provider(&self, provider_id: Uuid) -> Result<Vec<Booking>> {
        Ok(self
            .scan::<Booking>(CF_BOOKINGS)?
            .into_iter()
            .filter(|booking| booking.provider_id == provider_id)
            .collect())
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn insert(&self, mut payment: Payment) -> Result<Payment> {
        let _guard = self.write_lock.lock().await;
        if self.read::<Payment>(CF_PAYMENTS, payment.id)?.is_some() {
            return Err(BookpayError::Conflict(format!(
                "payment {} already exists",
                payment.transaction_id
            )));
        }
        self.ensure_no_other_active(&payment)?;

        payment.version = 1;
        let mut batch = WriteBatch::default();
        self.stage_payment(&mut batch, &payment)?;
        self.db.write(batch)?;
        Ok(payment)
    }

    async fn update(&self, mut payment: Payment) -> Result<Payment> {
        let _guard = self.write_lock.lock().await;
        let stored: Payment = self
            .read(CF_PAYMENTS, payment.id)?
            .ok_or_else(|| BookpayError::not_found("payment", payment.id))?;
        if stored.version != payment.version {
            return Err(BookpayError::Conflict(format!(
                "payment {} was modified concurrently",
                payment.id
            )));
        }
        self.ensure_no_other_active(&payment)?;

        payment.version += 1;
        let mut batch = WriteBatch::default();
        self.stage_payment(&mut batch, &payment)?;
        self.db.write(batch)?;
        Ok(payment)
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, payment_id)
    }

    async fn find_by_gateway_transaction(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Option<Payment>> {
        let cf = self.cf(CF_GATEWAY_TRANSACTIONS)?;
        match self.db.get_pinned_cf(cf, gateway_key(gateway, transaction_id))? {
            Some(bytes) => self.read(CF_PAYMENTS, decode_id(&bytes)?),
            None => Ok(None),
        }
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Vec<Payment>> {
        let mut found: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|payment| payment.booking_id == booking_id)
            .collect();
        found.sort_by_key(|payment| payment.created_at);
        Ok(found)
    }

    async fn get_all(&self) -> Result<Vec<Payment>> {
        self.scan(CF_PAYMENTS)
    }
}
