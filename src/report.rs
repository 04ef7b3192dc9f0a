//! Query time summaries and charges of aggregated usage.

use crate::accumulator::MetricWindows;
use crate::aggregator::{summarize, AggregatedUsage};
use crate::error::MeteringError;
use crate::plan::{PlanProvider, RateFormula, ResolvedPlans};
use crate::timewindow::{window_bounds, GRANULARITIES};
use tracing::{event, Level};

/// Fills `summary` and `charge` of every cell of a metric.
///
/// A cell that cannot be summarized reports zero.
pub fn rate_windows(windows: &mut MetricWindows, plans: &ResolvedPlans, processed: i64, time: i64) {
    let Some(definition) = plans.metering.metric(&windows.metric) else {
        event!(
            Level::WARN,
            metric = windows.metric.as_str(),
            plan = plans.metering_plan_id.as_str(),
            "Metric missing from plan, skipping summaries"
        );
        return;
    };
    let price = plans.price(&windows.metric);
    for (granularity, cells) in GRANULARITIES.iter().zip(windows.windows.iter_mut()) {
        for (offset, cell) in cells.iter_mut().enumerate() {
            let Some(cell) = cell else {
                continue;
            };
            let (from, to) = window_bounds(processed, *granularity, offset);
            let summary = match summarize(
                definition.summarize_formula(),
                &definition.name,
                time,
                Some(&cell.quantity),
                from,
                to,
            ) {
                Ok(summary) => summary,
                Err(err) => {
                    event!(Level::WARN, error = %err, granularity = %granularity, offset, "Summary failed");
                    0.0
                }
            };
            cell.summary = Some(summary);
            cell.charge = Some(match definition.rate_formula() {
                RateFormula::Linear => price * summary,
            });
        }
    }
}

/// Adds the charges of `source` into the matching cells of `target`.
fn add_charges(target: &mut MetricWindows, source: &MetricWindows) {
    for (target_cells, source_cells) in target.windows.iter_mut().zip(source.windows.iter()) {
        for (target_cell, source_cell) in target_cells.iter_mut().zip(source_cells.iter()) {
            if let (Some(t), Some(s)) = (target_cell.as_mut(), source_cell.as_ref()) {
                t.charge = Some(t.charge.unwrap_or(0.0) + s.charge.unwrap_or(0.0));
            }
        }
    }
}

/// Renders aggregated usage for reporting.
pub struct Reporter<P> {
    plans: P,
}

impl<P: PlanProvider> Reporter<P> {
    pub fn new(plans: P) -> Self {
        Self { plans }
    }

    /// Summaries and charges of every cell of `node`, evaluated at `time`.
    ///
    /// Plan level cells are charged with their own pricing. Resource level
    /// cells carry the sum of the charges of their plans.
    pub async fn report(&self, node: &AggregatedUsage, time: i64) -> Result<AggregatedUsage, MeteringError> {
        let mut report = node.at(time);
        let processed = report.processed;

        for resource in report.resources.iter_mut() {
            let mut resource_plans = None;
            for plan in resource.plans.iter_mut() {
                let plan_id = plan.plan_id.split('/').next().unwrap_or_default().to_string();
                let plans = self
                    .plans
                    .resolve(&resource.resource_id, &plan_id, processed)
                    .await?;
                for metric in plan.aggregated_usage.iter_mut() {
                    rate_windows(metric, &plans, processed, time);
                }
                resource_plans.get_or_insert(plans);
            }

            let Some(plans) = resource_plans else {
                continue;
            };
            for metric in resource.aggregated_usage.iter_mut() {
                rate_windows(metric, &plans, processed, time);
                for cells in metric.windows.iter_mut() {
                    for cell in cells.iter_mut().flatten() {
                        cell.charge = None;
                    }
                }
                for plan in &resource.plans {
                    if let Some(source) = plan.aggregated_usage.iter().find(|m| m.metric == metric.metric) {
                        add_charges(metric, source);
                    }
                }
            }
        }
        Ok(report)
    }
}
