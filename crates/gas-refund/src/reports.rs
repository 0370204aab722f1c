//! CSV exports of an epoch's refunds and the console summary

use anyhow::{Context, Result};
use csv::Writer;
use rust_decimal::Decimal;
use std::path::Path;
use tabled::Tabled;

use crate::types::{one_token, RefundRecord, RefundTransaction};

/// Write one row per address aggregate
pub fn export_records(path: &Path, records: &[RefundRecord]) -> Result<()> {
    let mut wtr = Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "Epoch",
        "Chain_Id",
        "Address",
        "Transactions",
        "Gas_Used",
        "Gas_Used_Chain_Currency",
        "Gas_Used_USD",
        "Total_Stake",
        "Refunded_Token",
        "Refunded_USD",
        "First_Block",
        "Last_Block",
        "First_Timestamp",
        "Last_Timestamp",
        "Completed",
    ])?;

    for record in records {
        wtr.write_record([
            &record.epoch.to_string(),
            &record.chain_id.to_string(),
            &format!("{:#x}", record.address),
            &record.transaction_count.to_string(),
            &record.accumulated_gas_used.to_string(),
            &record.accumulated_gas_used_chain_currency.to_string(),
            &format!("{:.2}", record.accumulated_gas_used_usd),
            &record.total_stake_amount.to_string(),
            &record.refunded_amount_token.to_string(),
            &format!("{:.2}", record.refunded_amount_usd),
            &record.first_block.to_string(),
            &record.last_block.to_string(),
            &record.first_timestamp.to_string(),
            &record.last_timestamp.to_string(),
            &record.is_completed.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Write one row per indexed transaction
pub fn export_transactions(path: &Path, rows: &[RefundTransaction]) -> Result<()> {
    let mut wtr = Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "Epoch",
        "Chain_Id",
        "Address",
        "Hash",
        "Block",
        "Timestamp",
        "Contract",
        "Gas_Used",
        "Gas_Price",
        "Gas_Used_USD",
        "Total_Stake",
        "Refunded_Token",
        "Refunded_USD",
        "Status",
    ])?;

    for row in rows {
        wtr.write_record([
            &row.epoch.to_string(),
            &row.chain_id.to_string(),
            &format!("{:#x}", row.address),
            &row.hash.to_string(),
            &row.block_number.to_string(),
            &row.timestamp.to_string(),
            &row.contract,
            &row.gas_used.to_string(),
            &row.gas_price.to_string(),
            &format!("{:.2}", row.gas_used_usd),
            &row.total_stake_amount.to_string(),
            &row.refunded_amount_token.to_string(),
            &format!("{:.2}", row.refunded_amount_usd),
            row.status.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Totals line printed after a run or an export
#[derive(Debug, Clone, PartialEq, Eq, Tabled)]
pub struct EpochSummary {
    #[tabled(rename = "Epoch")]
    pub epoch: u64,
    #[tabled(rename = "Chain")]
    pub chain_id: u64,
    #[tabled(rename = "Addresses")]
    pub addresses: usize,
    #[tabled(rename = "Transactions")]
    pub transactions: u64,
    #[tabled(rename = "Refunded (tokens)")]
    pub refunded_tokens: String,
    #[tabled(rename = "Refunded (USD)")]
    pub refunded_usd: String,
}

pub fn summarize(chain_id: u64, epoch: u64, records: &[RefundRecord]) -> EpochSummary {
    let tokens: Decimal = records.iter().map(|r| r.refunded_amount_token).sum();
    let usd: Decimal = records.iter().map(|r| r.refunded_amount_usd).sum();
    EpochSummary {
        epoch,
        chain_id,
        addresses: records.len(),
        transactions: records.iter().map(|r| r.transaction_count).sum(),
        refunded_tokens: format!("{:.4}", tokens / one_token()),
        refunded_usd: format!("{:.2}", usd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, tx_hash};
    use crate::types::whole_tokens;

    fn record(n: u8, tokens: u64, usd: &str) -> RefundRecord {
        RefundRecord {
            epoch: 30,
            address: addr(n),
            chain_id: 1,
            accumulated_gas_used: Decimal::from(21_000),
            accumulated_gas_used_chain_currency: Decimal::from(21_000_000_000_000u64),
            accumulated_gas_used_usd: "0.042".parse().unwrap(),
            accumulated_gas_used_token: Decimal::ZERO,
            total_stake_amount: whole_tokens(1_000),
            refunded_amount_token: whole_tokens(tokens),
            refunded_amount_usd: usd.parse().unwrap(),
            first_block: 10,
            last_block: 12,
            first_tx: tx_hash(1),
            last_tx: tx_hash(2),
            first_timestamp: 100,
            last_timestamp: 200,
            transaction_count: 2,
            is_completed: false,
            merkle_proof: vec![],
        }
    }

    #[test]
    fn test_export_records_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        export_records(&path, &[record(1, 3, "1.5"), record(2, 1, "0.5")]).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(&headers[2], "Address");
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], format!("{:#x}", addr(1)));
        assert_eq!(&rows[0][8], "3000000000000000000");
        assert_eq!(&rows[0][9], "1.50");
    }

    #[test]
    fn test_summary_totals() {
        let summary = summarize(1, 30, &[record(1, 3, "1.5"), record(2, 1, "0.5")]);
        assert_eq!(summary.addresses, 2);
        assert_eq!(summary.transactions, 4);
        assert_eq!(summary.refunded_tokens, "4.0000");
        assert_eq!(summary.refunded_usd, "2.00");
    }
}
