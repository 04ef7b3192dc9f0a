//! Metering, rating and pricing plans.
//!
//! Plans are configuration documents supplied from outside the engine.
//! Instead of carrying code, each metric names one formula out of a
//! closed set, and the engine ships the implementations: metering here,
//! accumulation in [`crate::accumulator`], aggregation and summaries in
//! [`crate::aggregator`].

use crate::cache::TtlCache;
use crate::error::{BusinessError, MeteringError};
use crate::usage::UsageDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// Bytes in a gigabyte, as used by memory and storage meters.
pub const GIGABYTE: f64 = 1073741824.0;

/// Country used when an account does not declare one.
pub const DEFAULT_COUNTRY: &str = "USA";

/// State of a continuously consumed metric within one window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeBasedQuantity {
    pub consuming: f64,
    pub consumed: f64,
    pub since: i64,
}

/// Accumulated or aggregated value of a window cell.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    TimeBased(TimeBasedQuantity),
}

impl Quantity {
    pub fn kind(&self) -> &'static str {
        match self {
            Quantity::Number(_) => "discrete",
            Quantity::TimeBased(_) => "time based",
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Quantity::Number(n) => n.is_finite(),
            Quantity::TimeBased(t) => t.consuming.is_finite() && t.consumed.is_finite(),
        }
    }
}

/// Output of a meter formula for one document.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metered {
    Number(f64),
    Consumption {
        consuming: f64,
        previous_consuming: f64,
    },
}

impl Metered {
    pub fn kind(&self) -> &'static str {
        match self {
            Metered::Number(_) => "discrete",
            Metered::Consumption { .. } => "time based",
        }
    }

    /// Net change of the consumption rate carried by the document.
    pub fn net_consuming(&self) -> Option<f64> {
        match self {
            Metered::Number(_) => None,
            Metered::Consumption {
                consuming,
                previous_consuming,
            } => Some(consuming + previous_consuming),
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Metered::Number(n) => n.is_finite(),
            Metered::Consumption {
                consuming,
                previous_consuming,
            } => consuming.is_finite() && previous_consuming.is_finite(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeteredUsage {
    pub metric: String,
    pub quantity: Metered,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Discrete,
    TimeBased,
}

/// Converts measures into a metric quantity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum MeterFormula {
    Measure { measure: String },
    Divide { measure: String, divisor: f64 },
    Product { measures: Vec<String> },
    /// Memory over time, from the current and previous instance measures.
    Memory,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulateFormula {
    Sum,
    Max,
    Min,
    Last,
    TimeBased,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFormula {
    Sum,
    TimeBased,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizeFormula {
    Identity,
    /// Gigabyte-hours consumed up to the query time.
    TimeBased,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFormula {
    /// `price * quantity`
    Linear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub unit: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub meter: MeterFormula,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulate: Option<AccumulateFormula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateFormula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarize: Option<SummarizeFormula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RateFormula>,
}

impl MetricDefinition {
    pub fn accumulate_formula(&self) -> AccumulateFormula {
        self.accumulate.unwrap_or(match self.metric_type {
            MetricType::Discrete => AccumulateFormula::Sum,
            MetricType::TimeBased => AccumulateFormula::TimeBased,
        })
    }

    pub fn aggregate_formula(&self) -> AggregateFormula {
        self.aggregate.unwrap_or(match self.metric_type {
            MetricType::Discrete => AggregateFormula::Sum,
            MetricType::TimeBased => AggregateFormula::TimeBased,
        })
    }

    pub fn summarize_formula(&self) -> SummarizeFormula {
        self.summarize.unwrap_or(match self.metric_type {
            MetricType::Discrete => SummarizeFormula::Identity,
            MetricType::TimeBased => SummarizeFormula::TimeBased,
        })
    }

    pub fn rate_formula(&self) -> RateFormula {
        self.rate.unwrap_or(RateFormula::Linear)
    }

    fn measure(&self, measures: &HashMap<&str, f64>, name: &str) -> Result<f64, BusinessError> {
        measures
            .get(name)
            .copied()
            .ok_or_else(|| BusinessError::MissingMeasure {
                metric: self.name.clone(),
                measure: name.to_string(),
            })
    }

    /// Applies the meter formula to the measures of a document.
    pub fn meter(&self, measures: &HashMap<&str, f64>) -> Result<Metered, BusinessError> {
        let metered = match &self.meter {
            MeterFormula::Measure { measure } => Metered::Number(self.measure(measures, measure)?),
            MeterFormula::Divide { measure, divisor } => {
                Metered::Number(self.measure(measures, measure)? / divisor)
            }
            MeterFormula::Product { measures: names } => {
                let mut product = 1.0;
                for name in names {
                    product *= self.measure(measures, name)?;
                }
                Metered::Number(product)
            }
            MeterFormula::Memory => {
                let value = |name: &str| measures.get(name).copied().unwrap_or(0.0);
                Metered::Consumption {
                    consuming: value("current_instance_memory") / GIGABYTE
                        * value("current_running_instances"),
                    previous_consuming: -(value("previous_instance_memory") / GIGABYTE
                        * value("previous_running_instances")),
                }
            }
        };
        if !metered.is_finite() {
            return Err(BusinessError::NonFiniteQuantity {
                metric: self.name.clone(),
            });
        }
        Ok(metered)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasureDefinition {
    pub name: String,
    pub unit: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeteringPlan {
    pub plan_id: String,
    #[serde(default)]
    pub measures: Vec<MeasureDefinition>,
    pub metrics: Vec<MetricDefinition>,
}

impl MeteringPlan {
    pub fn metric(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Meters every metric of the plan against a usage document.
    pub fn meter(&self, usage: &UsageDocument) -> Result<Vec<MeteredUsage>, BusinessError> {
        let measures = usage.measures();
        self.metrics
            .iter()
            .map(|metric| {
                Ok(MeteredUsage {
                    metric: metric.name.clone(),
                    quantity: metric.meter(&measures)?,
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CountryPrice {
    pub country: String,
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPrices {
    pub name: String,
    pub prices: Vec<CountryPrice>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub pricing_plan_id: String,
    pub metrics: Vec<MetricPrices>,
}

impl PricingPlan {
    /// Configured price of a metric in a country, 0 when absent.
    pub fn price(&self, metric: &str, country: &str) -> f64 {
        self.metrics
            .iter()
            .find(|m| m.name == metric)
            .and_then(|m| m.prices.iter().find(|p| p.country == country))
            .map(|p| p.price)
            .unwrap_or(0.0)
    }
}

/// Everything the pipeline needs to know about the plan of a document.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPlans {
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub metering: Arc<MeteringPlan>,
    pub pricing: Option<Arc<PricingPlan>>,
    pub pricing_country: String,
}

impl ResolvedPlans {
    pub fn new(metering: MeteringPlan) -> Self {
        let id = metering.plan_id.clone();
        Self {
            metering_plan_id: id.clone(),
            rating_plan_id: id.clone(),
            pricing_plan_id: id,
            metering: Arc::new(metering),
            pricing: None,
            pricing_country: DEFAULT_COUNTRY.to_string(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingPlan) -> Self {
        self.pricing_plan_id = pricing.pricing_plan_id.clone();
        self.pricing = Some(Arc::new(pricing));
        self
    }

    pub fn price(&self, metric: &str) -> f64 {
        self.pricing
            .as_ref()
            .map(|p| p.price(metric, &self.pricing_country))
            .unwrap_or(0.0)
    }

    /// Composite plan key used to group aggregated usage.
    pub fn plan_key(&self, plan_id: &str) -> String {
        [
            plan_id,
            self.metering_plan_id.as_str(),
            self.rating_plan_id.as_str(),
            self.pricing_plan_id.as_str(),
        ]
        .join("/")
    }
}

/// Source of plan configuration, implemented by the provisioning side.
#[async_trait]
pub trait PlanProvider: Send + Sync {
    /// Plans in effect for a resource plan at `time`. A missing plan is a
    /// business error.
    async fn resolve(
        &self,
        resource_id: &str,
        plan_id: &str,
        time: i64,
    ) -> Result<ResolvedPlans, MeteringError>;
}

/// Plans known up front, keyed by resource and plan id.
#[derive(Default)]
pub struct StaticPlanProvider {
    plans: HashMap<(String, String), ResolvedPlans>,
}

impl StaticPlanProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, resource_id: &str, plan_id: &str, plans: ResolvedPlans) -> Self {
        self.plans
            .insert((resource_id.to_string(), plan_id.to_string()), plans);
        self
    }
}

#[async_trait]
impl PlanProvider for StaticPlanProvider {
    async fn resolve(
        &self,
        resource_id: &str,
        plan_id: &str,
        _time: i64,
    ) -> Result<ResolvedPlans, MeteringError> {
        self.plans
            .get(&(resource_id.to_string(), plan_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                BusinessError::PlanNotFound {
                    resource_id: resource_id.to_string(),
                    plan_id: plan_id.to_string(),
                }
                .into()
            })
    }
}

/// Puts a bounded TTL cache in front of another provider.
pub struct CachedPlanProvider<P> {
    inner: P,
    cache: TtlCache<(String, String), ResolvedPlans>,
}

impl<P: PlanProvider> CachedPlanProvider<P> {
    pub fn new(inner: P, max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(max_entries, ttl),
        }
    }
}

#[async_trait]
impl<P: PlanProvider> PlanProvider for CachedPlanProvider<P> {
    async fn resolve(
        &self,
        resource_id: &str,
        plan_id: &str,
        time: i64,
    ) -> Result<ResolvedPlans, MeteringError> {
        let key = (resource_id.to_string(), plan_id.to_string());
        if let Some(plans) = self.cache.get(&key).await {
            return Ok(plans);
        }
        event!(Level::DEBUG, resource_id, plan_id, "Plan cache miss");
        let plans = self.inner.resolve(resource_id, plan_id, time).await?;
        self.cache.insert(key, plans.clone()).await;
        Ok(plans)
    }
}

#[cfg(test)]
pub(crate) fn storage_plan() -> MeteringPlan {
    serde_json::from_value(serde_json::json!({
        "plan_id": "basic",
        "measures": [{ "name": "storage", "unit": "BYTE" }],
        "metrics": [{
            "name": "storage",
            "unit": "GIGABYTE",
            "type": "discrete",
            "meter": { "fn": "divide", "measure": "storage", "divisor": GIGABYTE },
            "accumulate": "max"
        }]
    }))
    .unwrap()
}

#[cfg(test)]
pub(crate) fn memory_plan() -> MeteringPlan {
    serde_json::from_value(serde_json::json!({
        "plan_id": "standard",
        "measures": [
            { "name": "current_instance_memory", "unit": "BYTE" },
            { "name": "current_running_instances", "unit": "NUMBER" },
            { "name": "previous_instance_memory", "unit": "BYTE" },
            { "name": "previous_running_instances", "unit": "NUMBER" }
        ],
        "metrics": [{
            "name": "memory",
            "unit": "GIGABYTE",
            "type": "time_based",
            "meter": { "fn": "memory" }
        }]
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{test_document, MeasuredUsage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_plan_defaults() {
        let plan = memory_plan();
        let memory = plan.metric("memory").unwrap();
        assert_eq!(memory.accumulate_formula(), AccumulateFormula::TimeBased);
        assert_eq!(memory.aggregate_formula(), AggregateFormula::TimeBased);
        assert_eq!(memory.summarize_formula(), SummarizeFormula::TimeBased);

        let plan = storage_plan();
        let storage = plan.metric("storage").unwrap();
        assert_eq!(storage.accumulate_formula(), AccumulateFormula::Max);
        assert_eq!(storage.aggregate_formula(), AggregateFormula::Sum);
        assert_eq!(storage.rate_formula(), RateFormula::Linear);
        assert!(plan.metric("memory").is_none());
    }

    #[test]
    fn test_meter_storage() {
        let metered = storage_plan().meter(&test_document()).unwrap();
        assert_eq!(
            metered,
            vec![MeteredUsage {
                metric: "storage".to_string(),
                quantity: Metered::Number(1.0),
            }]
        );
    }

    #[test]
    fn test_meter_missing_measure() {
        let mut doc = test_document();
        doc.measured_usage[0].measure = "bandwidth".to_string();
        let err = storage_plan().meter(&doc).unwrap_err();
        assert_eq!(
            err,
            BusinessError::MissingMeasure {
                metric: "storage".to_string(),
                measure: "storage".to_string()
            }
        );
    }

    #[test]
    fn test_meter_memory() {
        let mut doc = test_document();
        doc.measured_usage = vec![
            MeasuredUsage {
                measure: "current_instance_memory".to_string(),
                quantity: 2147483648.0,
            },
            MeasuredUsage {
                measure: "current_running_instances".to_string(),
                quantity: 2.0,
            },
            MeasuredUsage {
                measure: "previous_instance_memory".to_string(),
                quantity: 1073741824.0,
            },
            MeasuredUsage {
                measure: "previous_running_instances".to_string(),
                quantity: 1.0,
            },
        ];
        let metered = memory_plan().meter(&doc).unwrap();
        assert_eq!(
            metered[0].quantity,
            Metered::Consumption {
                consuming: 4.0,
                previous_consuming: -1.0
            }
        );
        assert_eq!(metered[0].quantity.net_consuming(), Some(3.0));
    }

    #[test]
    fn test_meter_product_and_non_finite() {
        let metric: MetricDefinition = serde_json::from_value(serde_json::json!({
            "name": "api",
            "unit": "CALL",
            "type": "discrete",
            "meter": { "fn": "product", "measures": ["calls", "weight"] }
        }))
        .unwrap();
        let measures = HashMap::from([("calls", 10.0), ("weight", 1.5)]);
        assert_eq!(metric.meter(&measures), Ok(Metered::Number(15.0)));

        let divide: MetricDefinition = serde_json::from_value(serde_json::json!({
            "name": "ratio",
            "unit": "NUMBER",
            "type": "discrete",
            "meter": { "fn": "divide", "measure": "calls", "divisor": 0.0 }
        }))
        .unwrap();
        assert!(matches!(
            divide.meter(&measures),
            Err(BusinessError::NonFiniteQuantity { .. })
        ));
    }

    #[test]
    fn test_pricing() {
        let pricing = PricingPlan {
            pricing_plan_id: "storage-pricing".to_string(),
            metrics: vec![MetricPrices {
                name: "storage".to_string(),
                prices: vec![
                    CountryPrice {
                        country: "USA".to_string(),
                        price: 1.5,
                    },
                    CountryPrice {
                        country: "EUR".to_string(),
                        price: 1.2,
                    },
                ],
            }],
        };
        assert_eq!(pricing.price("storage", "EUR"), 1.2);
        assert_eq!(pricing.price("storage", "CAN"), 0.0);
        assert_eq!(pricing.price("memory", "USA"), 0.0);

        let plans = ResolvedPlans::new(storage_plan()).with_pricing(pricing);
        assert_eq!(plans.price("storage"), 1.5);
        assert_eq!(plans.plan_key("basic"), "basic/basic/basic/storage-pricing");
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlanProvider for CountingProvider {
        async fn resolve(
            &self,
            _resource_id: &str,
            _plan_id: &str,
            _time: i64,
        ) -> Result<ResolvedPlans, MeteringError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedPlans::new(storage_plan()))
        }
    }

    #[tokio::test]
    async fn test_cached_provider() {
        let provider = CachedPlanProvider::new(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            10,
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            provider.resolve("object-storage", "basic", 0).await.unwrap();
        }
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_provider_missing_plan() {
        let provider = StaticPlanProvider::new().with_plan(
            "object-storage",
            "basic",
            ResolvedPlans::new(storage_plan()),
        );
        assert!(provider.resolve("object-storage", "basic", 0).await.is_ok());
        let err = provider
            .resolve("object-storage", "premium", 0)
            .await
            .unwrap_err();
        assert!(err.is_business());
    }
}
