use crate::error::{BookpayError, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// Final state of one replayed booking and its latest payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub booking: String,
    pub booking_status: String,
    pub payment_status: String,
    /// Status of the booking's latest payment, empty when it has none.
    pub payment: String,
    pub amount: Decimal,
    pub refunded: Decimal,
    pub platform_fee: Decimal,
    pub gateway_fee: Decimal,
    pub attempts: u32,
}

pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_rows(&mut self, rows: impl IntoIterator<Item = ReportRow>) -> Result<()> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush().map_err(BookpayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_header_and_rows() {
        let mut out = Vec::new();
        ReportWriter::new(&mut out)
            .write_rows([ReportRow {
                booking: "b1".to_string(),
                booking_status: "confirmed".to_string(),
                payment_status: "paid".to_string(),
                payment: "completed".to_string(),
                amount: dec!(102.50),
                refunded: dec!(0),
                platform_fee: dec!(2.50),
                gateway_fee: dec!(0),
                attempts: 0,
            }])
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some(
                "booking,booking_status,payment_status,payment,amount,refunded,platform_fee,\
                 gateway_fee,attempts"
            )
        );
        assert_eq!(lines.next(), Some("b1,confirmed,paid,completed,102.50,0,2.50,0,0"));
    }
}
