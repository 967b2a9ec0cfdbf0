use std::path::Path;

use crate::db::transaction::Transaction;

pub struct Connection {
    inner: rusqlite::Connection,
}

impl Connection {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        rusqlite::Connection::open(path).map(|inner| Self { inner })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        rusqlite::Connection::open_in_memory().map(|inner| Self { inner })
    }

    pub(crate) fn inner(&self) -> &rusqlite::Connection {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut rusqlite::Connection {
        &mut self.inner
    }

    #[inline]
    pub fn transaction(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.inner.transaction().map(Transaction::new)
    }
}
