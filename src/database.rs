use crate::constants::DbFlags;
use crate::error::{Error, Result};

/// Handle of the catalog table, which maps table names to their records.
pub(crate) const CATALOG_DBI: u32 = 0;
/// Handle of the unnamed main table.
pub(crate) const MAIN_DBI: u32 = 1;

/// Table handle.
///
/// A handle is a small integer valid across transactions of the
/// environment that opened it, plus a generation that detects use after
/// [`Environment::close_table`](crate::Environment::close_table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    dbi: u32,
    generation: u32,
}

impl Database {
    pub(crate) fn new(dbi: u32, generation: u32) -> Self {
        Database { dbi, generation }
    }

    /// The unnamed main table.
    pub fn main() -> Self {
        Database::new(MAIN_DBI, 0)
    }

    /// Numeric handle.
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// Environment-wide entry for one open table handle.
#[derive(Debug, Clone)]
pub(crate) struct DbiSlot {
    /// `None` for the main table
    pub(crate) name: Option<String>,
    pub(crate) flags: DbFlags,
    pub(crate) generation: u32,
    /// Serial of the write transaction that created the table, until it commits.
    pub(crate) created_by: Option<u64>,
}

/// Table handles shared by all transactions of an environment.
///
/// Slot 0 is the catalog and slot 1 the main table; named tables take the
/// slots after them.
#[derive(Debug)]
pub(crate) struct TableRegistry {
    slots: Vec<Option<DbiSlot>>,
    generation: u32,
}

impl TableRegistry {
    pub(crate) fn new() -> Self {
        let main = DbiSlot {
            name: None,
            flags: DbFlags::empty(),
            generation: 0,
            created_by: None,
        };
        TableRegistry {
            slots: vec![None, Some(main)],
            generation: 0,
        }
    }

    /// Slot for a handle, checking that it has not been closed or reused.
    pub(crate) fn get(&self, db: Database) -> Result<&DbiSlot> {
        if db.dbi() == CATALOG_DBI {
            return Err(Error::BadDbi);
        }
        match self.slots.get(db.dbi() as usize) {
            Some(Some(slot)) if slot.generation == db.generation() => Ok(slot),
            _ => Err(Error::BadDbi),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<Database> {
        self.slots.iter().enumerate().find_map(|(dbi, slot)| match slot {
            Some(s) if s.name.as_deref() == Some(name) => Some(Database::new(dbi as u32, s.generation)),
            _ => None,
        })
    }

    /// Number of named tables with an open handle.
    pub(crate) fn named(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.name.is_some()).count()
    }

    pub(crate) fn register(
        &mut self,
        name: &str,
        flags: DbFlags,
        created_by: Option<u64>,
        max_tables: usize,
    ) -> Result<Database> {
        if self.named() >= max_tables {
            return Err(Error::DbsFull);
        }
        self.generation = self.generation.wrapping_add(1);
        let slot = DbiSlot {
            name: Some(name.to_owned()),
            flags,
            generation: self.generation,
            created_by,
        };
        let free = self
            .slots
            .iter()
            .enumerate()
            .skip(MAIN_DBI as usize + 1)
            .find(|(_, s)| s.is_none())
            .map(|(i, _)| i);
        let dbi = match free {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        Ok(Database::new(dbi as u32, self.generation))
    }

    pub(crate) fn set_flags(&mut self, db: Database, flags: DbFlags) {
        if let Some(Some(slot)) = self.slots.get_mut(db.dbi() as usize) {
            slot.flags = flags;
        }
    }

    /// Closes a named handle. The main table cannot be closed.
    pub(crate) fn close(&mut self, db: Database) -> Result<()> {
        self.get(db)?;
        if db.dbi() == MAIN_DBI {
            return Err(Error::BadDbi);
        }
        self.slots[db.dbi() as usize] = None;
        Ok(())
    }

    /// Forgets the handles created by an aborted write transaction.
    pub(crate) fn rollback(&mut self, serial: u64) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().and_then(|s| s.created_by) == Some(serial) {
                *slot = None;
            }
        }
    }

    /// Makes the handles created by a committed transaction permanent.
    pub(crate) fn settle(&mut self, serial: u64) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.created_by == Some(serial) {
                slot.created_by = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_reused_with_new_generation() {
        let mut reg = TableRegistry::new();
        let a = reg.register("a", DbFlags::empty(), None, 4).unwrap();
        assert_eq!(a.dbi(), 2);
        assert_eq!(reg.find("a"), Some(a));
        reg.close(a).unwrap();
        assert!(matches!(reg.get(a), Err(Error::BadDbi)));

        let b = reg.register("b", DbFlags::DUPSORT, None, 4).unwrap();
        assert_eq!(b.dbi(), 2);
        assert_ne!(a, b);
        assert!(matches!(reg.get(a), Err(Error::BadDbi)));
        assert_eq!(reg.get(b).unwrap().flags, DbFlags::DUPSORT);
    }

    #[test]
    fn limit_counts_named_tables_only() {
        let mut reg = TableRegistry::new();
        reg.register("a", DbFlags::empty(), None, 1).unwrap();
        assert!(matches!(
            reg.register("b", DbFlags::empty(), None, 1),
            Err(Error::DbsFull)
        ));
        assert!(matches!(reg.close(Database::main()), Err(Error::BadDbi)));
    }

    #[test]
    fn rollback_drops_uncommitted_handles() {
        let mut reg = TableRegistry::new();
        let kept = reg.register("kept", DbFlags::empty(), Some(7), 8).unwrap();
        let lost = reg.register("lost", DbFlags::empty(), Some(9), 8).unwrap();
        reg.settle(7);
        reg.rollback(9);
        reg.rollback(7);
        assert!(reg.get(kept).is_ok());
        assert!(reg.get(lost).is_err());
        assert_eq!(reg.find("lost"), None);
    }
}
