use core::ops::Bound;
use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use bytesize::ByteSize;
use im::OrdMap;
use libmdbx::{DatabaseFlags, Environment, Geometry, WriteFlags};
use log::info;
use snap::raw::{Decoder, Encoder};
use tap::Pipe as _;

pub use libmdbx::{TransactionKind, RO, RW};

const GROWTH_STEP: ByteSize = ByteSize::mib(256);
const MAX_NAMED_DATABASES: usize = 10;

pub type ReadTransaction = Transaction<RO>;
pub type WriteTransaction = Transaction<RW>;

type Pair = (Vec<u8>, Vec<u8>);

#[derive(Clone, Copy)]
pub enum DatabaseMode {
    ReadOnly,
    ReadWrite,
}

impl DatabaseMode {
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    #[must_use]
    pub const fn mode_permissions(self) -> u16 {
        match self {
            // <https://erthink.github.io/libmdbx/group__c__opening.html#gabb7dd3b10dd31639ba252df545e11768>
            // The UNIX permissions to set on created files. Zero value means to open existing, but do not create.
            Self::ReadOnly => 0,
            Self::ReadWrite => 0o600,
        }
    }

    #[must_use]
    #[cfg(target_os = "linux")]
    pub fn permissions(self) -> u32 {
        self.mode_permissions().into()
    }

    #[must_use]
    #[cfg(not(target_os = "linux"))]
    pub const fn permissions(self) -> u16 {
        self.mode_permissions()
    }
}

/// Ordered byte store with transactional access.
///
/// Values are compressed with Snappy at rest. Keys are stored as they are so that cursors can
/// iterate over them in lexicographic order.
pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(
        name: &str,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
        mode: DatabaseMode,
    ) -> Result<Self> {
        if !mode.is_read_only() {
            fs_err::create_dir_all(&directory)?;
        }

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open_with_permissions(directory.as_ref(), mode.permissions())?;

        if !mode.is_read_only() {
            let transaction = environment.begin_rw_txn()?;
            transaction.create_db(Some(name), DatabaseFlags::default())?;
            transaction.commit()?;
        }

        info!(
            "opened database {name} in {}",
            directory.as_ref().display(),
        );

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::default(),
        })
    }

    /// Runs `function` in a read-only transaction.
    ///
    /// The transaction sees a consistent snapshot unaffected by concurrent updates.
    pub fn view<T>(&self, function: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let transaction = match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                Transaction(TransactionInner::Persistent {
                    transaction,
                    database,
                })
            }
            DatabaseKind::InMemory { map } => {
                let map = map
                    .lock()
                    .expect("in-memory database mutex is poisoned")
                    .clone();

                Transaction(TransactionInner::InMemory { map })
            }
        };

        function(&transaction)
    }

    /// Runs `function` in a read-write transaction.
    ///
    /// Changes are committed if `function` succeeds and discarded if it returns an error.
    /// Updates are serialized.
    pub fn update<T>(
        &self,
        function: impl FnOnce(&mut WriteTransaction) -> Result<T>,
    ) -> Result<T> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut transaction = Transaction(TransactionInner::Persistent {
                    transaction,
                    database,
                });

                let output = function(&mut transaction)?;

                if let TransactionInner::Persistent { transaction, .. } = transaction.0 {
                    transaction.commit()?;
                }

                Ok(output)
            }
            DatabaseKind::InMemory { map } => {
                // Work on a copy and swap it in at the end so that a failed update leaves the map
                // untouched. Holding the lock for the whole update serializes writers.
                let mut map = map.lock().expect("in-memory database mutex is poisoned");

                let mut transaction = Transaction(TransactionInner::InMemory { map: map.clone() });

                let output = function(&mut transaction)?;

                if let TransactionInner::InMemory { map: new_map } = transaction.0 {
                    *map = new_map;
                }

                Ok(output)
            }
        }
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
    },
    InMemory {
        // Transactions clone the whole map, so the elements should be cheaply cloneable.
        // This disqualifies `Vec<u8>` and `Box<[u8]>`.
        map: Mutex<InMemoryMap>,
    },
}

pub struct Transaction<K: TransactionKind>(TransactionInner<K>);

enum TransactionInner<K: TransactionKind> {
    Persistent {
        transaction: libmdbx::Transaction<K>,
        database: libmdbx::Database,
    },
    InMemory {
        map: InMemoryMap,
    },
}

impl<K: TransactionKind> Transaction<K> {
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        match &self.0 {
            TransactionInner::Persistent {
                transaction,
                database,
            } => transaction
                .get::<Cow<_>>(database.dbi(), key.as_ref())?
                .map(|compressed| decompress(&compressed)),
            TransactionInner::InMemory { map } => map
                .get(key.as_ref())
                .map(|compressed| decompress(compressed)),
        }
        .transpose()
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        match &self.0 {
            TransactionInner::Persistent {
                transaction,
                database,
            } => transaction
                .get::<()>(database.dbi(), key.as_ref())?
                .is_some(),
            TransactionInner::InMemory { map } => map.contains_key(key.as_ref()),
        }
        .pipe(Ok)
    }

    pub fn cursor(&self) -> Result<Cursor<'_, K>> {
        match &self.0 {
            TransactionInner::Persistent {
                transaction,
                database,
            } => CursorInner::Persistent(transaction.cursor(database)?),
            TransactionInner::InMemory { map } => CursorInner::InMemory {
                map,
                position: None,
            },
        }
        .pipe(Cursor)
        .pipe(Ok)
    }
}

impl Transaction<RW> {
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let compressed = compress(value.as_ref())?;

        match &mut self.0 {
            TransactionInner::Persistent {
                transaction,
                database,
            } => {
                transaction.put(
                    database.dbi(),
                    key.as_ref(),
                    compressed,
                    WriteFlags::default(),
                )?;
            }
            TransactionInner::InMemory { map } => {
                map.insert(key.as_ref().into(), compressed.into());
            }
        }

        Ok(())
    }

    /// Returns `true` if `key` was present.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<bool> {
        match &mut self.0 {
            TransactionInner::Persistent {
                transaction,
                database,
            } => {
                let mut cursor = transaction.cursor(database)?;

                if cursor.set::<()>(key.as_ref())?.is_some() {
                    cursor.del(WriteFlags::default())?;
                    return Ok(true);
                }

                Ok(false)
            }
            TransactionInner::InMemory { map } => Ok(map.remove(key.as_ref()).is_some()),
        }
    }
}

/// Ordered iteration over the keys of a transaction.
///
/// A cursor that has not been positioned yet starts from the first key on [`Cursor::next`].
pub struct Cursor<'tx, K: TransactionKind>(CursorInner<'tx, K>);

enum CursorInner<'tx, K: TransactionKind> {
    Persistent(libmdbx::Cursor<K>),
    InMemory {
        map: &'tx InMemoryMap,
        position: Option<Arc<[u8]>>,
    },
}

impl<K: TransactionKind> Cursor<'_, K> {
    pub fn first(&mut self) -> Result<Option<Pair>> {
        match &mut self.0 {
            CursorInner::Persistent(cursor) => cursor
                .first::<Cow<_>, Cow<_>>()?
                .map(decompress_pair)
                .transpose(),
            CursorInner::InMemory { map, position } => {
                Self::in_memory_move(position, map.iter().next())
            }
        }
    }

    /// Positions the cursor at the first key greater than or equal to `key`.
    pub fn seek(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Pair>> {
        match &mut self.0 {
            CursorInner::Persistent(cursor) => cursor
                .set_range::<Cow<_>, Cow<_>>(key.as_ref())?
                .map(decompress_pair)
                .transpose(),
            CursorInner::InMemory { map, position } => {
                Self::in_memory_move(position, map.get_next(key.as_ref()))
            }
        }
    }

    pub fn next(&mut self) -> Result<Option<Pair>> {
        match &mut self.0 {
            CursorInner::Persistent(cursor) => cursor
                .next::<Cow<_>, Cow<_>>()?
                .map(decompress_pair)
                .transpose(),
            CursorInner::InMemory { map, position } => {
                let next = match position.as_deref() {
                    Some(current) => map
                        .range::<_, [u8]>((Bound::Excluded(current), Bound::Unbounded))
                        .next(),
                    None => map.iter().next(),
                };

                Self::in_memory_move(position, next)
            }
        }
    }

    fn in_memory_move(
        position: &mut Option<Arc<[u8]>>,
        entry: Option<(&Arc<[u8]>, &Arc<[u8]>)>,
    ) -> Result<Option<Pair>> {
        let Some((key, compressed)) = entry else {
            // Moving past the end leaves the cursor where it was, just like in `libmdbx`.
            return Ok(None);
        };

        *position = Some(Arc::clone(key));

        Ok(Some((key.to_vec(), decompress(compressed)?)))
    }
}

type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

fn decompress_pair((key, compressed_value): (Cow<[u8]>, Cow<[u8]>)) -> Result<Pair> {
    let value = decompress(&compressed_value)?;
    Ok((key.into_owned(), value))
}
