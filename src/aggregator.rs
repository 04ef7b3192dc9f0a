//! Hierarchical aggregation of accumulated usage.
//!
//! Every change of a resource instance is folded into each of its ancestor
//! nodes (account, organization, space, consumer) by delta replacement:
//! the previous contribution of the instance is removed and the current
//! one is added, cell by cell. A node therefore always equals the sum of
//! the current contributions of its children.

use crate::accumulator::{AccumulatedUsage, MetricWindows, WindowCell};
use crate::error::BusinessError;
use crate::plan::{AggregateFormula, Quantity, ResolvedPlans, SummarizeFormula, TimeBasedQuantity};
use crate::timewindow::{shift_time, truncate, Granularity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const HOUR_MS: f64 = 3600000.0;

fn mismatch(metric: &str, expected: &'static str, found: &'static str) -> BusinessError {
    BusinessError::QuantityMismatch {
        metric: metric.to_string(),
        expected,
        found,
    }
}

/// Replaces the previous contribution of a child by its current one.
///
/// Returns the aggregate unchanged when the child cell did not change, so
/// windows the child did not update are never touched.
pub fn aggregate(
    formula: AggregateFormula,
    metric: &str,
    aggregate: Option<&Quantity>,
    previous: Option<&Quantity>,
    current: Option<&Quantity>,
) -> Result<Option<Quantity>, BusinessError> {
    let Some(current) = current else {
        return Ok(aggregate.copied());
    };
    if previous == Some(current) {
        return Ok(aggregate.copied());
    }

    let result = match formula {
        AggregateFormula::Sum => {
            let number = |q: Option<&Quantity>| match q {
                None => Ok(0.0),
                Some(Quantity::Number(n)) => Ok(*n),
                Some(other) => Err(mismatch(metric, "discrete", other.kind())),
            };
            Quantity::Number(number(aggregate)? - number(previous)? + number(Some(current))?)
        }
        AggregateFormula::TimeBased => {
            let time_based = |q: Option<&Quantity>| match q {
                None => Ok(None),
                Some(Quantity::TimeBased(t)) => Ok(Some(*t)),
                Some(other) => Err(mismatch(metric, "time based", other.kind())),
            };
            let a = time_based(aggregate)?;
            let p = time_based(previous)?;
            let c = time_based(Some(current))?.ok_or_else(|| mismatch(metric, "time based", "empty"))?;
            let field = |f: fn(&TimeBasedQuantity) -> f64| {
                a.as_ref().map(f).unwrap_or(0.0) - p.as_ref().map(f).unwrap_or(0.0) + f(&c)
            };
            Quantity::TimeBased(TimeBasedQuantity {
                consuming: field(|q| q.consuming),
                consumed: field(|q| q.consumed),
                since: a.map(|a| a.since.max(c.since)).unwrap_or(c.since),
            })
        }
    };

    if !result.is_finite() {
        return Err(BusinessError::NonFiniteQuantity {
            metric: metric.to_string(),
        });
    }
    Ok(Some(result))
}

/// Reportable value of a cell covering `[from, to)`, evaluated at `time`.
///
/// Time based quantities stop on the window boundary: usage is never
/// extrapolated past `to`.
pub fn summarize(
    formula: SummarizeFormula,
    metric: &str,
    time: i64,
    quantity: Option<&Quantity>,
    from: i64,
    to: i64,
) -> Result<f64, BusinessError> {
    let Some(quantity) = quantity else {
        return Ok(0.0);
    };
    match (formula, quantity) {
        (SummarizeFormula::Identity, Quantity::Number(n)) => Ok(*n),
        (SummarizeFormula::TimeBased, Quantity::TimeBased(q)) => {
            let rt = time.min(to) as f64;
            let td = (from as f64 - rt) + (to as f64 - rt);
            Ok((q.consumed - q.consuming * td) / 2.0 / HOUR_MS)
        }
        (SummarizeFormula::Identity, other) => Err(mismatch(metric, "discrete", other.kind())),
        (SummarizeFormula::TimeBased, other) => Err(mismatch(metric, "time based", other.kind())),
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Account,
    Organization,
    Space,
    Consumer,
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HierarchyLevel::Account => write!(f, "account"),
            HierarchyLevel::Organization => write!(f, "organization"),
            HierarchyLevel::Space => write!(f, "space"),
            HierarchyLevel::Consumer => write!(f, "consumer"),
        }
    }
}

/// Usage of one plan of a resource, keyed by the composite plan key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanUsage {
    pub plan_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub aggregated_usage: Vec<MetricWindows>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_id: String,
    pub aggregated_usage: Vec<MetricWindows>,
    pub plans: Vec<PlanUsage>,
}

/// Last collected document of a child instance folded into a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildMarker {
    pub usage_id: String,
    pub processed: i64,
}

/// One node of the aggregation hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUsage {
    pub level: HierarchyLevel,
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub processed: i64,
    pub resources: Vec<ResourceUsage>,
    /// Last collected document folded in, per child instance. Children
    /// idle for longer than the month windows reach are forgotten.
    #[serde(default)]
    pub children: BTreeMap<String, ChildMarker>,
}

impl AggregatedUsage {
    pub fn new(level: HierarchyLevel, key: &str) -> Self {
        Self {
            level,
            key: key.to_string(),
            start: i64::MAX,
            end: i64::MIN,
            processed: i64::MIN,
            resources: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    /// Document id of the node in the aggregated usage store.
    pub fn id(&self) -> String {
        node_id(self.level, &self.key)
    }

    /// Id of the collected document last folded in for `instance`.
    pub fn child_marker(&self, instance: &str) -> Option<&str> {
        self.children.get(instance).map(|marker| marker.usage_id.as_str())
    }

    fn prune_children(&mut self) {
        let months = self
            .resources
            .iter()
            .flat_map(|r| r.aggregated_usage.iter())
            .map(|m| m.cells(Granularity::Month).len())
            .max()
            .unwrap_or(0);
        let horizon = shift_time(
            truncate(self.processed, Granularity::Month),
            Granularity::Month,
            -(months as i64),
        );
        self.children.retain(|_, marker| marker.processed >= horizon);
    }

    pub fn resource(&self, resource_id: &str) -> Option<&ResourceUsage> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    /// Copy of the node as it looks at `time`.
    pub fn at(&self, time: i64) -> Self {
        let mut node = self.clone();
        if time > node.processed {
            node.shift(time);
            node.processed = time;
        }
        node
    }

    fn shift(&mut self, time: i64) {
        if self.processed == i64::MIN {
            return;
        }
        for resource in self.resources.iter_mut() {
            for metric in resource.aggregated_usage.iter_mut() {
                metric.shift(self.processed, time);
            }
            for plan in resource.plans.iter_mut() {
                for metric in plan.aggregated_usage.iter_mut() {
                    metric.shift(self.processed, time);
                }
            }
        }
    }
}

pub fn node_id(level: HierarchyLevel, key: &str) -> String {
    format!("k/{}/{}", level, key)
}

/// Ancestor nodes of an instance, coarsest first.
pub fn ancestors(usage: &AccumulatedUsage) -> Vec<(HierarchyLevel, String)> {
    let mut nodes = Vec::with_capacity(4);
    if let Some(account) = &usage.account_id {
        nodes.push((HierarchyLevel::Account, account.clone()));
    }
    nodes.push((HierarchyLevel::Organization, usage.organization_id.clone()));
    nodes.push((
        HierarchyLevel::Space,
        format!("{}/{}", usage.organization_id, usage.space_id),
    ));
    nodes.push((
        HierarchyLevel::Consumer,
        format!(
            "{}/{}/{}",
            usage.organization_id, usage.space_id, usage.consumer_id
        ),
    ));
    nodes
}

fn metric_entry<'a>(metrics: &'a mut Vec<MetricWindows>, shape: &MetricWindows) -> &'a mut MetricWindows {
    match metrics.iter().position(|m| m.metric == shape.metric) {
        Some(position) => &mut metrics[position],
        None => {
            metrics.push(MetricWindows {
                metric: shape.metric.clone(),
                windows: shape.windows.iter().map(|cells| vec![None; cells.len()]).collect(),
            });
            let last = metrics.len() - 1;
            &mut metrics[last]
        }
    }
}

fn fold_windows(
    formula: AggregateFormula,
    target: &mut MetricWindows,
    previous: Option<&MetricWindows>,
    current: &MetricWindows,
) -> Result<bool, BusinessError> {
    let mut changed = false;
    for (g, current_cells) in current.windows.iter().enumerate() {
        if target.windows.len() <= g {
            target.windows.push(Vec::new());
        }
        let target_cells = &mut target.windows[g];
        if target_cells.len() < current_cells.len() {
            target_cells.resize(current_cells.len(), None);
        }
        for (i, current_cell) in current_cells.iter().enumerate() {
            let current_quantity = current_cell.as_ref().map(|c| c.quantity);
            let previous_quantity = previous
                .and_then(|p| p.windows.get(g))
                .and_then(|cells| cells.get(i))
                .and_then(|cell| cell.as_ref())
                .map(|c| c.quantity);
            if current_quantity.is_none() || current_quantity == previous_quantity {
                continue;
            }
            let old = target_cells[i].as_ref().map(|c| c.quantity);
            let new = aggregate(
                formula,
                &current.metric,
                old.as_ref(),
                previous_quantity.as_ref(),
                current_quantity.as_ref(),
            )?;
            if let Some(quantity) = new {
                target_cells[i] = Some(WindowCell {
                    quantity,
                    previous_quantity: old,
                    summary: None,
                    charge: None,
                });
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Folds instance changes into hierarchy nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aggregator;

impl Aggregator {
    /// Replaces the contribution `previous` of an instance by `current`
    /// in `node`. Returns whether any cell of the node changed.
    ///
    /// Folding the same collected document twice is a no-op.
    pub fn fold(
        &self,
        node: &mut AggregatedUsage,
        previous: Option<&AccumulatedUsage>,
        current: &AccumulatedUsage,
        plans: &ResolvedPlans,
    ) -> Result<bool, BusinessError> {
        let instance = current.instance_key();
        if node.child_marker(&instance) == Some(current.collected_usage_id.as_str()) {
            return Ok(false);
        }

        let time = node.processed.max(current.processed);
        node.shift(time);
        node.processed = time;
        node.start = node.start.min(current.start);
        node.end = node.end.max(current.end);

        let current_windows = current.windows_at(time);
        let previous_windows = previous.map(|p| p.windows_at(time));
        let plan_key = plans.plan_key(&current.plan_id);

        let resource = match node
            .resources
            .iter()
            .position(|r| r.resource_id == current.resource_id)
        {
            Some(position) => &mut node.resources[position],
            None => {
                node.resources.push(ResourceUsage {
                    resource_id: current.resource_id.clone(),
                    aggregated_usage: Vec::new(),
                    plans: Vec::new(),
                });
                let last = node.resources.len() - 1;
                &mut node.resources[last]
            }
        };
        let plan_position = match resource.plans.iter().position(|p| p.plan_id == plan_key) {
            Some(position) => position,
            None => {
                resource.plans.push(PlanUsage {
                    plan_id: plan_key,
                    metering_plan_id: plans.metering_plan_id.clone(),
                    rating_plan_id: plans.rating_plan_id.clone(),
                    pricing_plan_id: plans.pricing_plan_id.clone(),
                    aggregated_usage: Vec::new(),
                });
                resource.plans.len() - 1
            }
        };

        let mut changed = false;
        for metric in &current_windows {
            let definition = plans.metering.metric(&metric.metric).ok_or_else(|| {
                BusinessError::MetricNotFound {
                    plan_id: plans.metering_plan_id.clone(),
                    metric: metric.metric.clone(),
                }
            })?;
            let formula = definition.aggregate_formula();
            let previous_metric = previous_windows
                .as_ref()
                .and_then(|windows| windows.iter().find(|m| m.metric == metric.metric));

            let target = metric_entry(&mut resource.aggregated_usage, metric);
            changed |= fold_windows(formula, target, previous_metric, metric)?;
            let target = metric_entry(&mut resource.plans[plan_position].aggregated_usage, metric);
            changed |= fold_windows(formula, target, previous_metric, metric)?;
        }
        node.children.insert(
            instance,
            ChildMarker {
                usage_id: current.collected_usage_id.clone(),
                processed: current.processed,
            },
        );
        node.prune_children();
        Ok(changed)
    }
}
