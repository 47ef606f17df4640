//! Unified transaction feed
//!
//! Invoices, payments and on-chain transactions are converted to
//! [`GenericTx`], merged by timestamp and re-indexed. Paging is applied only
//! after the merge, over the fully materialized feed.

use super::types::{
    GenericTx, Invoice, InvoiceState, ListQuery, OnChainTransaction, Payment, PaymentStatus,
    TxCategory, TxFilter, TxStatus, TxType,
};

impl From<&Invoice> for GenericTx {
    fn from(invoice: &Invoice) -> Self {
        let status = match invoice.state {
            InvoiceState::Open | InvoiceState::Accepted => TxStatus::Pending,
            InvoiceState::Settled => TxStatus::Succeeded,
            InvoiceState::Canceled => TxStatus::Failed,
        };
        let amount = if invoice.state == InvoiceState::Settled {
            invoice.amt_paid_msat
        } else {
            invoice.value_msat
        };
        GenericTx {
            index: 0,
            id: invoice.add_index.clone(),
            category: TxCategory::Lightning,
            tx_type: TxType::Receive,
            amount_msat: amount as i64,
            time_stamp: invoice.settle_date.unwrap_or(invoice.creation_date),
            status,
            comment: invoice.memo.clone(),
            block_height: None,
            num_confs: None,
        }
    }
}

impl From<&Payment> for GenericTx {
    fn from(payment: &Payment) -> Self {
        let status = match payment.status {
            PaymentStatus::InFlight => TxStatus::Pending,
            PaymentStatus::Succeeded => TxStatus::Succeeded,
            PaymentStatus::Failed => TxStatus::Failed,
            PaymentStatus::Unknown => TxStatus::Unknown,
        };
        GenericTx {
            index: 0,
            id: payment.payment_hash.clone(),
            category: TxCategory::Lightning,
            tx_type: TxType::Send,
            amount_msat: -((payment.value_msat + payment.fee_msat) as i64),
            time_stamp: payment.creation_date,
            status,
            comment: String::new(),
            block_height: None,
            num_confs: None,
        }
    }
}

impl From<&OnChainTransaction> for GenericTx {
    fn from(tx: &OnChainTransaction) -> Self {
        let tx_type = match tx.amount {
            a if a < 0 => TxType::Send,
            a if a > 0 => TxType::Receive,
            _ => TxType::Unknown,
        };
        GenericTx {
            index: 0,
            id: tx.tx_hash.clone(),
            category: TxCategory::Onchain,
            tx_type,
            amount_msat: tx.amount.saturating_mul(1000),
            time_stamp: tx.time_stamp,
            status: if tx.num_confirmations > 0 {
                TxStatus::Succeeded
            } else {
                TxStatus::Pending
            },
            comment: tx.label.clone(),
            block_height: (tx.block_height > 0).then_some(tx.block_height),
            num_confs: Some(tx.num_confirmations),
        }
    }
}

/// Merge the three sources into one feed: sort ascending by timestamp,
/// reverse as a whole if requested, index 0..N, then page.
pub fn merge_transactions(
    invoices: &[Invoice],
    payments: &[Payment],
    onchain: &[OnChainTransaction],
    query: ListQuery,
    filter: TxFilter,
) -> Vec<GenericTx> {
    let mut merged: Vec<GenericTx> = invoices
        .iter()
        .map(GenericTx::from)
        .chain(payments.iter().map(GenericTx::from))
        .chain(onchain.iter().map(GenericTx::from))
        .filter(|tx| !filter.successful_only || tx.status == TxStatus::Succeeded)
        .collect();

    // Stable sort keeps source order for equal timestamps.
    merged.sort_by_key(|tx| tx.time_stamp);
    if query.reversed {
        merged.reverse();
    }

    for (index, tx) in merged.iter_mut().enumerate() {
        tx.index = index;
    }

    query.page(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(ts: i64, state: InvoiceState) -> Invoice {
        Invoice {
            add_index: format!("inv-{}", ts),
            payment_request: String::new(),
            payment_hash: String::new(),
            memo: "coffee".to_string(),
            value_msat: 5_000,
            amt_paid_msat: if state == InvoiceState::Settled { 5_000 } else { 0 },
            state,
            creation_date: ts,
            settle_date: None,
            expiry: 3600,
            settle_index: None,
            is_keysend: false,
        }
    }

    fn payment(ts: i64, status: PaymentStatus) -> Payment {
        Payment {
            payment_hash: format!("pay-{}", ts),
            payment_preimage: None,
            payment_request: None,
            value_msat: 10_000,
            fee_msat: 7,
            status,
            creation_date: ts,
            failure_reason: None,
            htlcs: Vec::new(),
        }
    }

    fn onchain(ts: i64, amount: i64, confs: u32) -> OnChainTransaction {
        OnChainTransaction {
            tx_hash: format!("tx-{}", ts),
            amount,
            num_confirmations: confs,
            block_height: if confs > 0 { 100 } else { 0 },
            time_stamp: ts,
            total_fees: 0,
            dest_addresses: Vec::new(),
            label: String::new(),
        }
    }

    fn fixture() -> (Vec<Invoice>, Vec<Payment>, Vec<OnChainTransaction>) {
        (
            vec![
                invoice(30, InvoiceState::Settled),
                invoice(10, InvoiceState::Open),
            ],
            vec![
                payment(20, PaymentStatus::Succeeded),
                payment(50, PaymentStatus::Failed),
            ],
            vec![onchain(40, 25_000, 3), onchain(5, -1_000, 0), onchain(60, -2_000, 1)],
        )
    }

    #[test]
    fn test_merge_sorted_and_indexed() {
        let (inv, pay, chain) = fixture();
        let merged = merge_transactions(&inv, &pay, &chain, ListQuery::all(), TxFilter::default());

        assert_eq!(merged.len(), 7);
        let stamps: Vec<i64> = merged.iter().map(|tx| tx.time_stamp).collect();
        assert_eq!(stamps, vec![5, 10, 20, 30, 40, 50, 60]);
        for (position, tx) in merged.iter().enumerate() {
            assert_eq!(tx.index, position);
        }
        assert_eq!(merged[2].amount_msat, -10_007);
        assert_eq!(merged[4].amount_msat, 25_000_000);
        assert_eq!(merged[0].tx_type, TxType::Send);
    }

    #[test]
    fn test_merge_reversed() {
        let (inv, pay, chain) = fixture();
        let query = ListQuery {
            reversed: true,
            ..ListQuery::all()
        };
        let merged = merge_transactions(&inv, &pay, &chain, query, TxFilter::default());
        let stamps: Vec<i64> = merged.iter().map(|tx| tx.time_stamp).collect();
        assert_eq!(stamps, vec![60, 50, 40, 30, 20, 10, 5]);
        assert_eq!(merged[0].index, 0);
        assert_eq!(merged[6].index, 6);
    }

    #[test]
    fn test_merge_successful_only() {
        let (inv, pay, chain) = fixture();
        let filter = TxFilter {
            successful_only: true,
        };
        let merged = merge_transactions(&inv, &pay, &chain, ListQuery::all(), filter);
        // Drops the open invoice, the failed payment and the unconfirmed tx.
        assert_eq!(merged.len(), 4);
        assert!(merged.iter().all(|tx| tx.status == TxStatus::Succeeded));
        for (position, tx) in merged.iter().enumerate() {
            assert_eq!(tx.index, position);
        }
    }

    #[test]
    fn test_paging_applies_after_merge() {
        let (inv, pay, chain) = fixture();
        let query = ListQuery {
            index_offset: 2,
            max_count: 3,
            reversed: false,
        };
        let page = merge_transactions(&inv, &pay, &chain, query, TxFilter::default());
        let stamps: Vec<i64> = page.iter().map(|tx| tx.time_stamp).collect();
        assert_eq!(stamps, vec![20, 30, 40]);
        // Indices refer to positions in the merged feed.
        assert_eq!(page[0].index, 2);
    }
}
