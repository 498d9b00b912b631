use crate::error::{BookpayError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One step of an operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOp {
    Book,
    Pay,
    Confirm,
    Decline,
    Retry,
    Webhook,
    WebhookFailed,
    Dispute,
    Refund,
    Cancel,
    Start,
    Complete,
}

/// A row of the replay CSV.
///
/// `booking` is a label local to the file; `minute` is the offset of the
/// step from the replay start. The remaining columns apply to some
/// operations only and may be left empty.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayRecord {
    #[serde(rename = "type")]
    pub op: ReplayOp,
    pub booking: String,
    pub minute: i64,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub hours: Option<u32>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Reads replay records from a CSV source, trimming whitespace and
/// accepting short rows.
pub struct ReplayReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ReplayReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes records; a malformed row yields an error and the
    /// iterator carries on with the next one.
    pub fn records(self) -> impl Iterator<Item = Result<ReplayRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(BookpayError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "type, booking, minute, amount, hours, gateway, reason\n\
                    book, b1, 0, 100, 72, ,\n\
                    pay, b1, 1, , , sandbox,\n\
                    cancel, b1, 5, , , , changed plans";
        let records: Vec<Result<ReplayRecord>> =
            ReplayReader::new(data.as_bytes()).records().collect();

        assert_eq!(records.len(), 3);
        let book = records[0].as_ref().unwrap();
        assert_eq!(book.op, ReplayOp::Book);
        assert_eq!(book.amount, Some(dec!(100)));
        assert_eq!(book.hours, Some(72));
        assert_eq!(book.gateway, None);

        let pay = records[1].as_ref().unwrap();
        assert_eq!(pay.gateway.as_deref(), Some("sandbox"));

        let cancel = records[2].as_ref().unwrap();
        assert_eq!(cancel.reason.as_deref(), Some("changed plans"));
    }

    #[test]
    fn test_reader_short_rows_and_snake_case_ops() {
        let data = "type,booking,minute,amount,hours,gateway,reason\nwebhook_failed,b2,3";
        let records: Vec<Result<ReplayRecord>> =
            ReplayReader::new(data.as_bytes()).records().collect();
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.op, ReplayOp::WebhookFailed);
        assert_eq!(record.amount, None);
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "type,booking,minute\nteleport,b1,0\nbook,b1,soon";
        let records: Vec<Result<ReplayRecord>> =
            ReplayReader::new(data.as_bytes()).records().collect();
        assert!(records[0].is_err());
        assert!(records[1].is_err());
    }
}
