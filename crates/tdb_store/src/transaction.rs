//! Request-scoped state: the meta-transaction spanning engines and the set
//! of kinds this request has written to.

use std::collections::{BTreeMap, HashSet};

use log::{debug, error};
use sea_orm::{DatabaseTransaction, TransactionTrait};

use crate::engine::{Conn, Engine};
use tdb_core::{TdbError, TdbResult};

/// At most one open transaction per engine, opened on first write once
/// [`TransactionSet::begin`] has been called.
#[derive(Default)]
pub struct TransactionSet {
    begun: bool,
    open: BTreeMap<String, DatabaseTransaction>,
}

impl TransactionSet {
    pub fn begin(&mut self) {
        self.begun = true;
    }

    pub fn is_active(&self) -> bool {
        self.begun
    }

    /// Engines with an open transaction, in name order.
    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.open.keys().map(String::as_str)
    }

    /// Join `engine` to the active transaction. No-op when none is active
    /// or the engine already participates.
    pub async fn add_engine(&mut self, engine: &Engine) -> TdbResult<()> {
        if !self.begun || self.open.contains_key(engine.name()) {
            return Ok(());
        }
        let tx = engine
            .connection()
            .begin()
            .await
            .map_err(|err| engine.unavailable(err))?;
        debug!("engine {} joined meta-transaction", engine.name());
        self.open.insert(engine.name().to_string(), tx);
        Ok(())
    }

    pub(crate) fn transaction(&self, engine: &str) -> Option<&DatabaseTransaction> {
        self.open.get(engine)
    }

    pub async fn commit(&mut self) -> TdbResult<()> {
        self.finish(true).await
    }

    pub async fn rollback(&mut self) -> TdbResult<()> {
        self.finish(false).await
    }

    /// Settles every participant, then clears all state even if one of
    /// them failed. The first failure is returned.
    async fn finish(&mut self, commit: bool) -> TdbResult<()> {
        self.begun = false;
        let open = std::mem::take(&mut self.open);
        let mut first_err = None;
        for (name, tx) in open {
            let result = if commit {
                tx.commit().await
            } else {
                tx.rollback().await
            };
            if let Err(err) = result {
                let action = if commit { "commit" } else { "rollback" };
                error!("meta-transaction {action} failed on engine {name}: {err}");
                first_err.get_or_insert(TdbError::engine_unavailable(&name, err.to_string()));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Everything that is scoped to one logical request. Create one per
/// request with [`crate::ThingStore::new_context`] and never share it.
#[derive(Default)]
pub struct RequestContext {
    pub(crate) tx: TransactionSet,
    sticky: HashSet<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(&mut self) -> &mut TransactionSet {
        &mut self.tx
    }

    pub fn begin(&mut self) {
        self.tx.begin();
    }

    pub async fn commit(&mut self) -> TdbResult<()> {
        self.tx.commit().await
    }

    pub async fn rollback(&mut self) -> TdbResult<()> {
        self.tx.rollback().await
    }

    pub fn is_sticky(&self, kind: &str) -> bool {
        self.sticky.contains(kind)
    }

    pub(crate) fn mark_sticky(&mut self, kind: &str) {
        if !self.sticky.contains(kind) {
            self.sticky.insert(kind.to_string());
        }
    }

    /// Statements against `engine` run inside the open transaction when
    /// there is one, else on the pool.
    pub(crate) fn conn<'a>(&'a self, engine: &'a Engine) -> Conn<'a> {
        match self.tx.transaction(engine.name()) {
            Some(tx) => Conn::Tx(tx),
            None => Conn::Pool(engine.connection()),
        }
    }
}
