//! Per-broker asset subscription filter

use parking_lot::RwLock;
use std::collections::HashSet;

use publisher_core::{AssetId, SignedPriceUpdateBatch};

/// Mutable set of assets a broker wants. Replacing the set takes effect on
/// the next batch the writer filters.
#[derive(Debug, Default)]
pub struct AssetFilter {
    assets: RwLock<HashSet<AssetId>>,
}

impl AssetFilter {
    pub fn new(assets: HashSet<AssetId>) -> Self {
        Self {
            assets: RwLock::new(assets),
        }
    }

    pub fn update(&self, assets: HashSet<AssetId>) {
        *self.assets.write() = assets;
    }

    pub fn is_wildcard(&self) -> bool {
        self.assets.read().iter().any(AssetId::is_wildcard)
    }

    /// Subset of `batch` this broker is subscribed to
    pub fn filter_batch(&self, batch: &SignedPriceUpdateBatch) -> SignedPriceUpdateBatch {
        let assets = self.assets.read();
        if assets.iter().any(AssetId::is_wildcard) {
            return batch.clone();
        }

        batch
            .iter()
            .filter(|(asset, _)| assets.contains(*asset))
            .map(|(asset, update)| (asset.clone(), update.clone()))
            .collect()
    }

    pub fn sorted_assets(&self) -> Vec<AssetId> {
        let mut assets: Vec<AssetId> = self.assets.read().iter().cloned().collect();
        assets.sort();
        assets
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}
