//! Account checkout: time-boxed, session-scoped account leases.
//!
//! A lease row per account records which orchestration session holds it,
//! on which instance, and since when. Leases older than the store's
//! staleness window count as absent and can be taken by any session.
//! Every mutation runs in a single redb write transaction.

use redb::{ReadableDatabase, ReadableTable, Table};
use tracing::{debug, info, warn};

use botgrid_core::InstanceId;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, epoch_millis, map_err};
use crate::tables::ACCOUNT_LEASES;
use crate::types::AccountLease;

type LeaseTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// What [`StateStore::reconcile_instance`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Store and instance agree.
    InSync,
    /// The store held a lease for an account the instance no longer uses.
    Cleared { account: String },
    /// The instance uses an account the store had no lease for.
    Claimed { account: String },
    /// The instance switched accounts; old lease dropped, new one taken.
    Replaced { old: String, new: String },
}

impl StateStore {
    /// Lease `account` to `session_id` on `instance`.
    ///
    /// Succeeds if the account is unleased, already held by this session,
    /// or held by a lease older than the staleness window.
    pub fn checkout(
        &self,
        account: &str,
        session_id: &str,
        instance: InstanceId,
    ) -> StateResult<AccountLease> {
        self.checkout_at(account, session_id, instance, epoch_millis())
    }

    /// [`checkout`](Self::checkout) with an explicit clock.
    pub fn checkout_at(
        &self,
        account: &str,
        session_id: &str,
        instance: InstanceId,
        now_ms: u64,
    ) -> StateResult<AccountLease> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let lease = {
            let mut table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
            self.checkout_in(&mut table, account, session_id, instance, now_ms)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%account, session = %session_id, instance, "account checked out");
        Ok(lease)
    }

    /// Release `account` if `session_id` holds it.
    ///
    /// Returns `Ok(false)` if nothing was leased; fails if another session
    /// holds the lease.
    pub fn release_account(&self, account: &str, session_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
            match read_lease(&table, account)? {
                None => false,
                Some(held) if held.session_id == session_id => {
                    table.remove(account).map_err(map_err!(Write))?;
                    true
                }
                Some(held) => {
                    return Err(StateError::LeaseNotHeld {
                        account: account.to_string(),
                        holder: held.session_id,
                    });
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%account, session = %session_id, released, "account release");
        Ok(released)
    }

    /// Drop every lease held by a session. Returns the number removed.
    pub fn release_all_for_session(&self, session_id: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
            let accounts = leases_matching(&table, |l| l.session_id == session_id)?
                .into_iter()
                .map(|l| l.account)
                .collect::<Vec<_>>();
            count = accounts.len() as u32;
            for account in &accounts {
                table.remove(account.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            info!(session = %session_id, count, "released all session leases");
        }
        Ok(count)
    }

    /// Current lease on `account`, if any (stale leases included).
    pub fn get_lease(&self, account: &str) -> StateResult<Option<AccountLease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
        read_lease(&table, account)
    }

    /// Whether `lease` has outlived the staleness window at `now_ms`.
    pub fn is_stale(&self, lease: &AccountLease, now_ms: u64) -> bool {
        lease.age_ms(now_ms) > self.lease_stale_after.as_millis() as u64
    }

    /// The live lease the store believes is in use on `instance`.
    pub fn lease_for_instance(&self, instance: InstanceId) -> StateResult<Option<AccountLease>> {
        self.lease_for_instance_at(instance, epoch_millis())
    }

    pub fn lease_for_instance_at(
        &self,
        instance: InstanceId,
        now_ms: u64,
    ) -> StateResult<Option<AccountLease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
        self.live_lease_on(&table, instance, now_ms)
    }

    /// All leases held by a session.
    pub fn list_leases_for_session(&self, session_id: &str) -> StateResult<Vec<AccountLease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
        leases_matching(&table, |l| l.session_id == session_id)
    }

    /// Correct drift between the lease the store holds for `instance` and
    /// the account actually signed in on it.
    pub fn reconcile_instance(
        &self,
        instance: InstanceId,
        session_id: &str,
        actual_account: Option<&str>,
    ) -> StateResult<ReconcileOutcome> {
        self.reconcile_instance_at(instance, session_id, actual_account, epoch_millis())
    }

    pub fn reconcile_instance_at(
        &self,
        instance: InstanceId,
        session_id: &str,
        actual_account: Option<&str>,
        now_ms: u64,
    ) -> StateResult<ReconcileOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
            let believed = self.live_lease_on(&table, instance, now_ms)?;

            match (believed, actual_account) {
                (None, None) => ReconcileOutcome::InSync,
                (Some(lease), Some(actual)) if lease.account == actual => ReconcileOutcome::InSync,
                (Some(lease), None) => {
                    table
                        .remove(lease.account.as_str())
                        .map_err(map_err!(Write))?;
                    ReconcileOutcome::Cleared {
                        account: lease.account,
                    }
                }
                (None, Some(actual)) => {
                    self.checkout_in(&mut table, actual, session_id, instance, now_ms)?;
                    ReconcileOutcome::Claimed {
                        account: actual.to_string(),
                    }
                }
                (Some(lease), Some(actual)) => {
                    table
                        .remove(lease.account.as_str())
                        .map_err(map_err!(Write))?;
                    self.checkout_in(&mut table, actual, session_id, instance, now_ms)?;
                    ReconcileOutcome::Replaced {
                        old: lease.account,
                        new: actual.to_string(),
                    }
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        if outcome != ReconcileOutcome::InSync {
            warn!(instance, session = %session_id, ?outcome, "account lease drift corrected");
        }
        Ok(outcome)
    }

    fn checkout_in(
        &self,
        table: &mut LeaseTable<'_>,
        account: &str,
        session_id: &str,
        instance: InstanceId,
        now_ms: u64,
    ) -> StateResult<AccountLease> {
        if let Some(held) = read_lease(&*table, account)? {
            if held.session_id != session_id && !self.is_stale(&held, now_ms) {
                return Err(StateError::LeaseConflict {
                    account: account.to_string(),
                    holder: held.session_id,
                    instance: held.instance,
                });
            }
            if held.session_id != session_id {
                info!(%account, stale_holder = %held.session_id, "reclaiming stale lease");
            }
        }

        let lease = AccountLease {
            account: account.to_string(),
            session_id: session_id.to_string(),
            instance,
            leased_at_ms: now_ms,
        };
        let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
        table
            .insert(account, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(lease)
    }

    fn live_lease_on(
        &self,
        table: &impl ReadableTable<&'static str, &'static [u8]>,
        instance: InstanceId,
        now_ms: u64,
    ) -> StateResult<Option<AccountLease>> {
        let live = leases_matching(table, |l| l.instance == instance && !self.is_stale(l, now_ms))?;
        Ok(live.into_iter().max_by_key(|l| l.leased_at_ms))
    }
}

fn read_lease(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    account: &str,
) -> StateResult<Option<AccountLease>> {
    match table.get(account).map_err(map_err!(Read))? {
        Some(guard) => {
            let lease: AccountLease =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(lease))
        }
        None => Ok(None),
    }
}

fn leases_matching(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    keep: impl Fn(&AccountLease) -> bool,
) -> StateResult<Vec<AccountLease>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let lease: AccountLease =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if keep(&lease) {
            results.push(lease);
        }
    }
    Ok(results)
}
