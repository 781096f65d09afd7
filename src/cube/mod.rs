//! Cubes
//!
//! A cube is an ordered tuple of dimensions (fixed at creation) plus two
//! sparse cell stores; see [`storage`] for the stores and their streams.

pub mod storage;

use crate::dimension::check_name;
use crate::error::Result;
use crate::ident::{CubeId, DimensionId};

/// Cube metadata. Cell data lives in [`storage::MixedStorage`].
#[derive(Debug, Clone)]
pub struct Cube {
    id: CubeId,
    name: String,
    dimension_ids: Vec<DimensionId>,
}

impl Cube {
    pub fn new(id: CubeId, name: &str, dimension_ids: Vec<DimensionId>) -> Result<Self> {
        check_name(name)?;
        Ok(Cube {
            id,
            name: name.to_string(),
            dimension_ids,
        })
    }

    pub fn id(&self) -> CubeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension_ids(&self) -> &[DimensionId] {
        &self.dimension_ids
    }

    pub fn dim_count(&self) -> usize {
        self.dimension_ids.len()
    }
}
