use serde::{Deserialize, Serialize};

use super::plan::QueryPlan;

/// Lower bound for `total_cost`, keeps ratios finite
pub const MIN_TOTAL_COST: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub startup_cost: f64,
    pub total_cost: f64,
    pub rows: u64,
    pub width: u32,
}

impl CostEstimate {
    pub fn new(startup_cost: f64, total_cost: f64, rows: u64, width: u32) -> Self {
        Self {
            startup_cost,
            total_cost: total_cost.max(MIN_TOTAL_COST),
            rows,
            width,
        }
    }

    pub fn combine(self, other: CostEstimate) -> CostEstimate {
        CostEstimate::new(
            self.startup_cost + other.startup_cost,
            self.total_cost + other.total_cost,
            other.rows,
            other.width,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    Btree,
    Hash,
    Composite,
}

/// Advisory only; never applied to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecommendation {
    pub collection: String,
    pub fields: Vec<String>,
    pub index_type: IndexType,
    pub estimated_benefit: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub original_cost: f64,
    pub optimized_plan: QueryPlan,
    pub cost_reduction: f64,
    pub optimizations_applied: Vec<String>,
    pub index_recommendations: Vec<IndexRecommendation>,
    pub estimated_speedup: f64,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cost_is_clamped() {
        let estimate = CostEstimate::new(0.0, 0.0, 0, 8);
        assert!((estimate.total_cost - MIN_TOTAL_COST).abs() < f64::EPSILON);
        let negative = CostEstimate::new(0.0, -5.0, 0, 8);
        assert!(negative.total_cost >= MIN_TOTAL_COST);
    }
}
