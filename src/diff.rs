//! Classification of a fetched batch against stored delivery records.

use std::collections::{HashMap, HashSet};

use crate::model::{AccountId, DeliveryLifecycle, DeliveryRecord, ExternalTxId, RemoteTxn};
use crate::render::content_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    IgnoredAccount,
    Unchanged,
    /// A `Failed` record is terminal.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Changed {
    pub record: DeliveryRecord,
    pub txn: RemoteTxn,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct New {
    pub txn: RemoteTxn,
    pub hash: String,
    /// Set when a provisional row from an unconfirmed send exists.
    pub pending: Option<DeliveryRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    pub to_notify: Vec<New>,
    pub to_update: Vec<Changed>,
    pub skip: Vec<(ExternalTxId, SkipReason)>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.to_notify.is_empty() && self.to_update.is_empty()
    }
}

/// Classify every transaction of `batch` into exactly one of the three sets,
/// preserving batch order inside each set. Depends only on its inputs.
pub fn classify(
    batch: &[RemoteTxn],
    ignored: &HashSet<AccountId>,
    records: &HashMap<ExternalTxId, DeliveryRecord>,
) -> DiffOutcome {
    let mut out = DiffOutcome::default();
    for txn in batch {
        if txn.account_id.map_or(false, |a| ignored.contains(&a)) {
            out.skip.push((txn.id, SkipReason::IgnoredAccount));
            continue;
        }

        let hash = content_hash(txn);
        match records.get(&txn.id) {
            None => out.to_notify.push(New {
                txn: txn.clone(),
                hash,
                pending: None,
            }),
            Some(rec) => match rec.lifecycle {
                DeliveryLifecycle::Failed => out.skip.push((txn.id, SkipReason::Failed)),
                DeliveryLifecycle::Pending if rec.message_id.is_none() => {
                    out.to_notify.push(New {
                        txn: txn.clone(),
                        hash,
                        pending: Some(rec.clone()),
                    })
                }
                _ if rec.content_hash == hash => {
                    out.skip.push((txn.id, SkipReason::Unchanged))
                }
                _ => out.to_update.push(Changed {
                    record: rec.clone(),
                    txn: txn.clone(),
                    hash,
                }),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn txn(id: i64, account: i64) -> RemoteTxn {
        RemoteTxn {
            id,
            date: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            account_id: Some(account),
            account_name: None,
            amount: 10.0,
            currency: "usd".into(),
            payee: format!("payee {}", id),
            category_id: None,
            category_name: None,
            category_group_name: None,
            notes: None,
            reviewed: false,
            is_pending: false,
            recurring: false,
            tags: vec![],
            merchant_name: None,
            authorized_at: None,
            plaid_id: None,
            pending_plaid_id: None,
        }
    }

    fn record(t: &RemoteTxn, lifecycle: DeliveryLifecycle, message_id: Option<i32>) -> DeliveryRecord {
        DeliveryRecord {
            user_id: 1,
            external_tx_id: t.id,
            message_id,
            content_hash: content_hash(t),
            lifecycle,
            send_attempts: 1,
            plaid_id: None,
        }
    }

    #[test]
    fn three_transaction_batch() {
        let a = txn(1, 100);
        let b = txn(2, 200);
        let c = txn(3, 100);
        let mut records = HashMap::new();
        records.insert(c.id, record(&c, DeliveryLifecycle::Delivered, Some(77)));
        let mut c_now = c.clone();
        c_now.category_id = Some(9);
        c_now.category_name = Some("Groceries".into());

        let ignored = HashSet::from([200]);
        let out = classify(&[a.clone(), b.clone(), c_now.clone()], &ignored, &records);

        assert_eq!(out.to_notify.len(), 1);
        assert_eq!(out.to_notify[0].txn.id, a.id);
        assert_eq!(out.to_update.len(), 1);
        assert_eq!(out.to_update[0].record.message_id, Some(77));
        assert_eq!(out.to_update[0].hash, content_hash(&c_now));
        assert_eq!(out.skip, vec![(b.id, SkipReason::IgnoredAccount)]);
    }

    #[test]
    fn classification_is_idempotent() {
        let batch = vec![txn(1, 1), txn(2, 1), txn(3, 2)];
        let mut records = HashMap::new();
        records.insert(2, record(&batch[1], DeliveryLifecycle::Delivered, Some(5)));
        let ignored = HashSet::from([2]);
        assert_eq!(
            classify(&batch, &ignored, &records),
            classify(&batch, &ignored, &records)
        );
    }

    #[test]
    fn unchanged_and_failed_are_skipped() {
        let a = txn(1, 1);
        let b = txn(2, 1);
        let mut records = HashMap::new();
        records.insert(a.id, record(&a, DeliveryLifecycle::Delivered, Some(1)));
        let mut failed = record(&b, DeliveryLifecycle::Failed, Some(2));
        failed.content_hash = "stale".into();
        records.insert(b.id, failed);

        let out = classify(&[a, b], &HashSet::new(), &records);
        assert!(out.is_empty());
        assert_eq!(
            out.skip,
            vec![(1, SkipReason::Unchanged), (2, SkipReason::Failed)]
        );
    }

    #[test]
    fn unconfirmed_pending_is_renotified() {
        let a = txn(1, 1);
        let mut records = HashMap::new();
        records.insert(a.id, record(&a, DeliveryLifecycle::Pending, None));
        let out = classify(&[a.clone()], &HashSet::new(), &records);
        assert_eq!(out.to_notify.len(), 1);
        assert!(out.to_notify[0].pending.is_some());
    }

    #[test]
    fn ignored_account_wins_over_existing_record() {
        let mut a = txn(1, 1);
        let mut records = HashMap::new();
        records.insert(a.id, record(&a, DeliveryLifecycle::Delivered, Some(3)));
        a.notes = Some("moved".into());
        let out = classify(&[a], &HashSet::from([1]), &records);
        assert!(out.is_empty());
        assert_eq!(out.skip, vec![(1, SkipReason::IgnoredAccount)]);
    }

    #[test]
    fn batch_order_is_preserved() {
        let batch: Vec<_> = (1..=5).rev().map(|i| txn(i, 1)).collect();
        let out = classify(&batch, &HashSet::new(), &HashMap::new());
        let ids: Vec<_> = out.to_notify.iter().map(|n| n.txn.id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);
    }
}
