use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::EngineManager;
use crate::transaction::RequestContext;
use tdb_core::{TdbError, TdbResult, TypeId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Read,
    Write,
}

/// A table set living on one engine.
pub trait Routed {
    fn engine(&self) -> &str;
}

pub fn thing_kind(type_id: TypeId) -> String {
    format!("t{type_id}")
}

pub fn rel_kind(type_id: TypeId) -> String {
    format!("r{type_id}")
}

/// Picks the engine for each statement. Writes go to the master and pin
/// later reads of the same kind to it for the rest of the request.
pub struct Router {
    rng: Mutex<StdRng>,
    disallow_writes: bool,
}

impl Router {
    pub fn new(seed: Option<u64>, disallow_writes: bool) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            disallow_writes,
        }
    }

    pub fn resolve<'a, T: Routed>(
        &self,
        ctx: &mut RequestContext,
        engines: &EngineManager,
        kind: &str,
        action: Action,
        tables: &'a [T],
        avoid_master_reads: bool,
    ) -> TdbResult<&'a T> {
        let master = tables
            .first()
            .ok_or_else(|| TdbError::configuration(format!("no tables for kind {kind}")))?;
        match action {
            Action::Write => {
                if self.disallow_writes {
                    return Err(TdbError::writes_disallowed(format!(
                        "write to {kind} on {}",
                        master.engine()
                    )));
                }
                ctx.mark_sticky(kind);
                Ok(master)
            }
            Action::Read if ctx.is_sticky(kind) => Ok(master),
            Action::Read => {
                let pool = if avoid_master_reads && tables.len() > 1 {
                    &tables[1..]
                } else {
                    tables
                };
                let alive: Vec<&T> = pool
                    .iter()
                    .filter(|table| engines.is_alive(table.engine()))
                    .collect();
                if alive.is_empty() {
                    return Ok(self.pick(pool));
                }
                Ok(self.pick_ref(&alive))
            }
        }
    }

    pub fn resolve_read<'a, T: Routed>(
        &self,
        ctx: &mut RequestContext,
        engines: &EngineManager,
        kind: &str,
        tables: &'a [T],
        avoid_master_reads: bool,
    ) -> TdbResult<&'a T> {
        self.resolve(ctx, engines, kind, Action::Read, tables, avoid_master_reads)
    }

    pub fn resolve_write<'a, T: Routed>(
        &self,
        ctx: &mut RequestContext,
        engines: &EngineManager,
        kind: &str,
        tables: &'a [T],
    ) -> TdbResult<&'a T> {
        self.resolve(ctx, engines, kind, Action::Write, tables, false)
    }

    /// Uniform index in `0..len`; 0 for empty or single-element sets.
    pub fn choose_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..len)
    }

    fn pick<'a, T>(&self, candidates: &'a [T]) -> &'a T {
        &candidates[self.choose_index(candidates.len())]
    }

    fn pick_ref<'a, T>(&self, candidates: &[&'a T]) -> &'a T {
        candidates[self.choose_index(candidates.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::{Router, Routed, thing_kind};
    use crate::engine::EngineManager;
    use crate::transaction::RequestContext;
    use tdb_core::{ErrorKind, TypeId};

    #[derive(Debug)]
    struct Table(&'static str);

    impl Routed for Table {
        fn engine(&self) -> &str {
            self.0
        }
    }

    static TABLES: [Table; 3] = [Table("master"), Table("replica1"), Table("replica2")];

    #[test]
    fn writes_are_sticky_for_reads() {
        let router = Router::new(Some(7), false);
        let engines = EngineManager::default();
        let mut ctx = RequestContext::new();
        let kind = thing_kind(TypeId(3));
        let write = router
            .resolve_write(&mut ctx, &engines, &kind, &TABLES)
            .expect("write");
        assert_eq!(write.engine(), "master");
        for _ in 0..20 {
            let read = router
                .resolve_read(&mut ctx, &engines, &kind, &TABLES, true)
                .expect("read");
            assert_eq!(read.engine(), "master");
        }
    }

    #[test]
    fn avoid_master_reads_uses_replicas() {
        let router = Router::new(Some(11), false);
        let engines = EngineManager::default();
        let mut ctx = RequestContext::new();
        for _ in 0..50 {
            let read = router
                .resolve_read(&mut ctx, &engines, "t1", &TABLES, true)
                .expect("read");
            assert_ne!(read.engine(), "master");
        }
    }

    #[test]
    fn single_table_reads_from_master() {
        let router = Router::new(None, false);
        let engines = EngineManager::default();
        let mut ctx = RequestContext::new();
        let read = router
            .resolve_read(&mut ctx, &engines, "t1", &TABLES[..1], true)
            .expect("read");
        assert_eq!(read.engine(), "master");
    }

    #[test]
    fn disallowed_writes_fail() {
        let router = Router::new(None, true);
        let engines = EngineManager::default();
        let mut ctx = RequestContext::new();
        let err = router
            .resolve_write(&mut ctx, &engines, "t1", &TABLES)
            .expect_err("read only");
        assert_eq!(err.kind(), ErrorKind::WritesDisallowed);
        assert!(!ctx.is_sticky("t1"));
    }
}
