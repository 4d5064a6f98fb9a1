//! CSV output for account snapshots
//!
//! Used by the `report` subcommand to dump every account of a journal.
//! Columns: user, spendable, staked, total, external_address, active

use crate::types::Account;
use std::io::Write;

/// Write accounts as CSV, sorted by user id
///
/// # Arguments
///
/// * `accounts` - Account snapshots to write
/// * `output` - Destination writer (stdout for the CLI)
///
/// # Errors
///
/// Returns a message if writing or flushing fails.
pub fn write_accounts_csv(accounts: &[Account], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(["user", "spendable", "staked", "total", "external_address", "active"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted_accounts = accounts.to_vec();
    sorted_accounts.sort_by_key(|account| account.user_id);

    for account in sorted_accounts {
        let total = account
            .total()
            .map(|total| total.to_string())
            .unwrap_or_else(|| "overflow".to_string());
        writer
            .write_record(&[
                account.user_id.to_string(),
                account.spendable.to_string(),
                account.staked.to_string(),
                total,
                account
                    .external_address
                    .as_ref()
                    .map(|address| address.to_string())
                    .unwrap_or_default(),
                account.active.to_string(),
            ])
            .map_err(|e| format!("Failed to write account record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExternalAddress, UserId};
    use chrono::Utc;

    fn account(user: u64, spendable: u64, staked: u64, address: Option<&str>) -> Account {
        let mut account = Account::new(UserId(user), Utc::now());
        account.spendable = spendable;
        account.staked = staked;
        account.external_address = address.and_then(ExternalAddress::parse);
        account
    }

    #[test]
    fn test_write_accounts_csv_sorted_with_header() {
        let accounts = vec![account(2, 5, 0, None), account(1, 60, 40, Some("rUser1"))];
        let mut output = Vec::new();

        write_accounts_csv(&accounts, &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(
            text,
            "user,spendable,staked,total,external_address,active\n\
             1,60,40,100,rUser1,true\n\
             2,5,0,5,,true\n"
        );
    }

    #[test]
    fn test_write_empty_accounts_writes_header_only() {
        let mut output = Vec::new();

        write_accounts_csv(&[], &mut output).unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "user,spendable,staked,total,external_address,active\n"
        );
    }
}
