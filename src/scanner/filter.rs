use std::collections::BTreeSet;

use rand::{rngs::StdRng, SeedableRng};
use scalable_cuckoo_filter::{DefaultHasher, ScalableCuckooFilter, ScalableCuckooFilterBuilder};

use crate::chain::{Address, Transaction};

/// Set of tracked collection addresses
pub struct CollectionFilter {
    /// Set of addresses to search for
    addresses: BTreeSet<Address>,

    /// Cuckoo filter for fast address inclusion check
    cuckoo: ScalableCuckooFilter<Address, DefaultHasher, StdRng>,
}

impl CollectionFilter {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let addresses: BTreeSet<_> = addresses.into_iter().collect();
        let mut cuckoo = ScalableCuckooFilterBuilder::new()
            .initial_capacity(addresses.len().max(1))
            .rng(StdRng::from_entropy())
            .finish();

        addresses.iter().for_each(|addr| {
            cuckoo.insert(addr);
        });

        Self { addresses, cuckoo }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.cuckoo.contains(address) && self.addresses.contains(address)
    }

    /// Tracked collections any message of `txs` came from or went to
    pub fn matches<'a>(&self, txs: impl IntoIterator<Item = &'a Transaction>) -> BTreeSet<Address> {
        txs.into_iter()
            .flat_map(Transaction::addresses)
            .filter(|addr| self.contains(addr))
            .copied()
            .collect()
    }
}
