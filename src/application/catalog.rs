//! TOML catalogues of promotions used to seed a store.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    application::{datastore::Row, error::AppError},
    domain::{marketplace::PROMOTIONS, promotions::Promotion},
    infra::{error::InfraError, memory_store::MemoryStore},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionCatalog {
    pub promotions: Vec<Promotion>,
}

impl PromotionCatalog {
    pub fn parse(data: &str) -> Result<Self, AppError> {
        let mut catalog: PromotionCatalog = toml::from_str(data)
            .map_err(|err| AppError::validation(format!("invalid catalog: {err}")))?;
        catalog.normalize();
        for promotion in &catalog.promotions {
            promotion.validate()?;
        }
        Ok(catalog)
    }

    fn normalize(&mut self) {
        for promotion in &mut self.promotions {
            promotion.id = promotion.id.trim().to_string();
            promotion.title = promotion.title.trim().to_string();
        }
    }

    pub fn to_rows(&self) -> Result<Vec<Row>, AppError> {
        self.promotions
            .iter()
            .map(|promotion| match serde_json::to_value(promotion) {
                Ok(serde_json::Value::Object(row)) => Ok(row),
                Ok(other) => Err(AppError::unexpected(format!(
                    "promotion encoded as {other}"
                ))),
                Err(err) => Err(AppError::unexpected(format!(
                    "failed to encode promotion: {err}"
                ))),
            })
            .collect()
    }

    /// Write every promotion into `store`.
    pub fn seed(&self, store: &MemoryStore) -> Result<usize, AppError> {
        let rows = self.to_rows()?;
        let count = rows.len();
        store.seed(PROMOTIONS, rows);
        Ok(count)
    }
}

/// Read and validate the catalogue at `path`.
pub fn load_catalog(path: &Path) -> Result<PromotionCatalog, AppError> {
    let data = fs::read_to_string(path)
        .map_err(|err| InfraError::catalog(path.display().to_string(), err.to_string()))?;
    PromotionCatalog::parse(&data)
}
