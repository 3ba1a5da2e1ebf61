//! Layered views over the unspent-output set.
//!
//! A `StoreCoins` is the persistent base; a `CoinCache` stacks on any
//! parent view, reads through it, and pushes its whole delta down in
//! one `apply` call. Stacking a scratch cache on the tip cache is the
//! mechanism behind "try to connect, roll back if invalid".

use std::collections::HashMap;
use std::fmt;

use kestrel_consensus::Hash256;
use kestrel_primitives::encoding::DecodeError;
use kestrel_primitives::{OutPoint, Transaction, TxOut};
use kestrel_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::Coins;

pub const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Debug)]
pub enum CoinViewError {
    Store(StoreError),
    Decode(DecodeError),
    ReadOnly,
}

impl fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinViewError::Store(err) => write!(f, "{err}"),
            CoinViewError::Decode(err) => write!(f, "corrupt coin record: {err}"),
            CoinViewError::ReadOnly => write!(f, "view does not accept writes"),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err)
    }
}

impl From<DecodeError> for CoinViewError {
    fn from(err: DecodeError) -> Self {
        CoinViewError::Decode(err)
    }
}

/// The modifications a cache layer pushes into its parent at once.
#[derive(Clone, Debug, Default)]
pub struct CoinsDelta {
    /// `None` means the record is pruned.
    pub coins: Vec<(Hash256, Option<Coins>)>,
    pub best_block: Option<Hash256>,
}

pub trait CoinView {
    /// Fetches the coin record for a txid, read-through.
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinViewError>;

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError>;

    /// Applies the whole delta or none of it.
    fn apply(&mut self, delta: &CoinsDelta) -> Result<(), CoinViewError>;

    fn have_coins(&mut self, txid: &Hash256) -> Result<bool, CoinViewError> {
        Ok(self
            .coins(txid)?
            .map(|coins| !coins.is_pruned())
            .unwrap_or(false))
    }
}

impl<V: CoinView + ?Sized> CoinView for &mut V {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinViewError> {
        (**self).coins(txid)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        (**self).best_block()
    }

    fn apply(&mut self, delta: &CoinsDelta) -> Result<(), CoinViewError> {
        (**self).apply(delta)
    }
}

/// Base view over the persistent coins column.
pub struct StoreCoins<S> {
    store: S,
}

impl<S: KeyValueStore> StoreCoins<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinView for StoreCoins<S> {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinViewError> {
        match self.store.get(Column::Coins, txid)? {
            Some(bytes) => Ok(Some(Coins::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            Some(_) => Err(CoinViewError::Decode(DecodeError::UnexpectedEnd)),
            None => Ok(None),
        }
    }

    fn apply(&mut self, delta: &CoinsDelta) -> Result<(), CoinViewError> {
        let mut batch = WriteBatch::new();
        for (txid, coins) in &delta.coins {
            match coins {
                Some(coins) if !coins.is_pruned() => {
                    batch.put(Column::Coins, *txid, coins.encode());
                }
                _ => batch.delete(Column::Coins, *txid),
            }
        }
        if let Some(best) = delta.best_block {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, best.to_vec());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

/// Write-back cache over any parent view.
pub struct CoinCache<P> {
    parent: P,
    entries: HashMap<Hash256, Option<Coins>>,
    best: Option<Hash256>,
}

impl<P: CoinView> CoinCache<P> {
    pub fn new(parent: P) -> Self {
        Self {
            parent,
            entries: HashMap::new(),
            best: None,
        }
    }

    /// Upserts a record; an empty record prunes.
    pub fn set_coins(&mut self, txid: Hash256, coins: Coins) {
        let entry = if coins.is_pruned() { None } else { Some(coins) };
        self.entries.insert(txid, entry);
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best = Some(hash);
    }

    /// Fetches one output; fails softly when the position is pruned.
    pub fn get_output(&mut self, outpoint: &OutPoint) -> Result<Option<TxOut>, CoinViewError> {
        Ok(self
            .coins(&outpoint.hash)?
            .and_then(|coins| coins.output(outpoint.index).cloned()))
    }

    /// True when every prevout of `tx` is present and unspent.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool, CoinViewError> {
        for input in &tx.vin {
            match self.coins(&input.prevout.hash)? {
                Some(coins) if coins.is_available(input.prevout.index) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Pushes every cached modification into the parent; on success the
    /// cache is empty, on failure it is untouched.
    pub fn flush(&mut self) -> Result<(), CoinViewError> {
        let delta = CoinsDelta {
            coins: self.entries.drain().collect(),
            best_block: self.best,
        };
        match self.parent.apply(&delta) {
            Ok(()) => {
                self.best = None;
                Ok(())
            }
            Err(err) => {
                self.entries.extend(delta.coins);
                Err(err)
            }
        }
    }

    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    pub fn parent_mut(&mut self) -> &mut P {
        &mut self.parent
    }
}

impl<P: CoinView> CoinView for CoinCache<P> {
    fn coins(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinViewError> {
        if let Some(entry) = self.entries.get(txid) {
            return Ok(entry.clone());
        }
        let fetched = self.parent.coins(txid)?;
        self.entries.insert(*txid, fetched.clone());
        Ok(fetched)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        if let Some(best) = self.best {
            return Ok(Some(best));
        }
        self.parent.best_block()
    }

    fn apply(&mut self, delta: &CoinsDelta) -> Result<(), CoinViewError> {
        for (txid, coins) in &delta.coins {
            self.entries.insert(*txid, coins.clone());
        }
        if let Some(best) = delta.best_block {
            self.best = Some(best);
        }
        Ok(())
    }
}
