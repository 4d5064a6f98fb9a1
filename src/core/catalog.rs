//! Product price catalog
//!
//! Product search and inventory are owned elsewhere; the wallet only needs a
//! unit price per item id when an order is confirmed. The catalog is loaded
//! once from a JSON object mapping item ids to prices in token units:
//!
//! ```json
//! { "tomatoes-1kg": 12, "sourdough": 7 }
//! ```

use super::traits::PriceCatalog;
use crate::types::{TokenAmount, WalletError};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    prices: HashMap<String, TokenAmount>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load prices from a JSON file
    ///
    /// # Errors
    ///
    /// * `Config` - the file cannot be read or is not an object of prices
    pub fn from_json_file(path: &Path) -> Result<Self, WalletError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WalletError::config(format!("catalog {}: {}", path.display(), e)))?;
        let prices: HashMap<String, TokenAmount> = serde_json::from_str(&raw)
            .map_err(|e| WalletError::config(format!("catalog {}: {}", path.display(), e)))?;

        info!(path = %path.display(), items = prices.len(), "Price catalog loaded");
        Ok(Self { prices })
    }

    pub fn with_price(mut self, item_id: impl Into<String>, unit_price: TokenAmount) -> Self {
        self.prices.insert(item_id.into(), unit_price);
        self
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PriceCatalog for InMemoryCatalog {
    fn unit_price(&self, item_id: &str) -> Option<TokenAmount> {
        self.prices.get(item_id).copied()
    }
}
