//! This module contains the structure that accumulates metered usage
//! into the time windows of a single resource instance.
//!
//! Each metric of an instance keeps one window array per granularity.
//! A new document is folded into the cell its end time falls in, for every
//! granularity, through the accumulate formula of the metric. Cells whose
//! window does not contain the document are left untouched.

use crate::error::BusinessError;
use crate::plan::{AccumulateFormula, Metered, MeteredUsage, Quantity, ResolvedPlans, TimeBasedQuantity};
use crate::timewindow::{shift_windows, window_bounds, Granularity, TimeWindowConfig, GRANULARITIES};
use crate::usage::UsageDocument;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

/// One slot of a window array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowCell {
    pub quantity: Quantity,
    /// Value of the cell before the last document that changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge: Option<f64>,
}

impl WindowCell {
    pub fn new(quantity: Quantity) -> Self {
        Self {
            quantity,
            previous_quantity: None,
            summary: None,
            charge: None,
        }
    }
}

/// Window arrays of one metric, finest granularity first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricWindows {
    pub metric: String,
    pub windows: Vec<Vec<Option<WindowCell>>>,
}

impl MetricWindows {
    pub fn empty(metric: &str, config: &TimeWindowConfig) -> Self {
        Self {
            metric: metric.to_string(),
            windows: config.empty_windows(),
        }
    }

    pub fn cells(&self, granularity: Granularity) -> &[Option<WindowCell>] {
        self.windows
            .get(granularity.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ages every window array from `before` to `after`.
    pub fn shift(&mut self, before: i64, after: i64) {
        for (granularity, cells) in GRANULARITIES.iter().zip(self.windows.iter_mut()) {
            shift_windows(cells, before, after, *granularity);
        }
    }
}

/// Outcome of folding one metered quantity into one window cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Accumulation {
    Updated(Quantity),
    /// The usage belongs to another window. The cell stays as it was.
    Rejected,
}

fn mismatch(metric: &str, expected: &'static str, found: &'static str) -> BusinessError {
    BusinessError::QuantityMismatch {
        metric: metric.to_string(),
        expected,
        found,
    }
}

/// Folds a metered quantity into the previous value of the cell covering
/// `[from, to)`. Usage ending outside of that window is rejected.
#[allow(clippy::too_many_arguments)]
pub fn accumulate(
    formula: AccumulateFormula,
    metric: &str,
    previous: Option<&Quantity>,
    metered: &Metered,
    start: i64,
    end: i64,
    from: i64,
    to: i64,
) -> Result<Accumulation, BusinessError> {
    if end < from || end >= to {
        return Ok(Accumulation::Rejected);
    }

    let quantity = match formula {
        AccumulateFormula::TimeBased => {
            let Metered::Consumption {
                consuming,
                previous_consuming,
            } = *metered
            else {
                return Err(mismatch(metric, "time based", metered.kind()));
            };
            let previous = match previous {
                None => None,
                Some(Quantity::TimeBased(q)) => Some(*q),
                Some(other) => return Err(mismatch(metric, "time based", other.kind())),
            };
            // Contribution of a rate change at `start`, anchored on both
            // window boundaries so it can be evaluated at any instant later.
            let begin = start as f64;
            let td = (from as f64 - begin) + (to as f64 - begin);
            let (consuming_now, since) = match previous {
                Some(p) if p.since > start => (p.consuming, p.since),
                _ => (consuming, start),
            };
            Quantity::TimeBased(TimeBasedQuantity {
                consuming: consuming_now,
                consumed: consuming * td
                    + previous_consuming * td
                    + previous.map(|p| p.consumed).unwrap_or(0.0),
                since,
            })
        }
        discrete => {
            let Metered::Number(value) = *metered else {
                return Err(mismatch(metric, "discrete", metered.kind()));
            };
            let previous = match previous {
                None => None,
                Some(Quantity::Number(n)) => Some(*n),
                Some(other) => return Err(mismatch(metric, "discrete", other.kind())),
            };
            Quantity::Number(match (discrete, previous) {
                (_, None) | (AccumulateFormula::Last, _) => value,
                (AccumulateFormula::Max, Some(p)) => p.max(value),
                (AccumulateFormula::Min, Some(p)) => p.min(value),
                (_, Some(p)) => p + value,
            })
        }
    };

    if !quantity.is_finite() {
        return Err(BusinessError::NonFiniteQuantity {
            metric: metric.to_string(),
        });
    }
    Ok(Accumulation::Updated(quantity))
}

/// Accumulated state of one resource instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedUsage {
    pub organization_id: String,
    pub space_id: String,
    pub consumer_id: String,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub start: i64,
    pub end: i64,
    /// Collected document this state was last updated from.
    pub collected_usage_id: String,
    pub processed: i64,
    pub processed_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub accumulated_usage: Vec<MetricWindows>,
}

impl AccumulatedUsage {
    pub fn metric(&self, name: &str) -> Option<&MetricWindows> {
        self.accumulated_usage.iter().find(|m| m.metric == name)
    }

    pub fn instance_key(&self) -> String {
        [
            self.organization_id.as_str(),
            self.resource_instance_id.as_str(),
            self.consumer_id.as_str(),
            self.plan_id.as_str(),
        ]
        .join("/")
    }

    /// Copy of the windows as they look at `time`.
    pub fn windows_at(&self, time: i64) -> Vec<MetricWindows> {
        let mut windows = self.accumulated_usage.clone();
        for metric in windows.iter_mut() {
            metric.shift(self.processed, time);
        }
        windows
    }
}

/// Folds metered documents into the accumulated state of their instance.
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    windows: TimeWindowConfig,
}

impl Accumulator {
    pub fn new(windows: TimeWindowConfig) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &TimeWindowConfig {
        &self.windows
    }

    /// Produces the next state of an instance from its previous state and
    /// a newly metered document processed at `processed`.
    ///
    /// Fails with [`BusinessError::SlackExceeded`] when the document is too
    /// old for even the month windows.
    pub fn accumulate(
        &self,
        previous: Option<&AccumulatedUsage>,
        usage: &UsageDocument,
        metered: &[MeteredUsage],
        plans: &ResolvedPlans,
        processed: i64,
        processed_id: String,
    ) -> Result<AccumulatedUsage, BusinessError> {
        let mut metrics = match previous {
            Some(p) => p.windows_at(processed),
            None => Vec::new(),
        };
        for metric in metrics.iter_mut() {
            for cell in metric.windows.iter_mut().flatten().flatten() {
                cell.previous_quantity = None;
            }
        }

        for m in metered {
            let definition = plans.metering.metric(&m.metric).ok_or_else(|| {
                BusinessError::MetricNotFound {
                    plan_id: plans.metering_plan_id.clone(),
                    metric: m.metric.clone(),
                }
            })?;
            let formula = definition.accumulate_formula();

            let position = match metrics.iter().position(|w| w.metric == m.metric) {
                Some(position) => position,
                None => {
                    metrics.push(MetricWindows::empty(&m.metric, &self.windows));
                    metrics.len() - 1
                }
            };
            let windows = &mut metrics[position].windows;

            for (granularity, cells) in GRANULARITIES.iter().zip(windows.iter_mut()) {
                let Some(slot) = self.windows.slot(*granularity, cells.len(), processed, usage.end)
                else {
                    if *granularity == Granularity::Month {
                        event!(
                            Level::DEBUG,
                            end = usage.end,
                            processed,
                            "Usage is older than the month windows"
                        );
                        return Err(BusinessError::SlackExceeded { end: usage.end });
                    }
                    continue;
                };
                let (from, to) = window_bounds(processed, *granularity, slot);
                let cell = &mut cells[slot];
                let old = cell.as_ref().map(|c| c.quantity);
                match accumulate(
                    formula,
                    &m.metric,
                    old.as_ref(),
                    &m.quantity,
                    usage.start,
                    usage.end,
                    from,
                    to,
                )? {
                    Accumulation::Updated(quantity) => {
                        *cell = Some(WindowCell {
                            quantity,
                            previous_quantity: old,
                            summary: None,
                            charge: None,
                        });
                    }
                    Accumulation::Rejected => {
                        event!(
                            Level::DEBUG,
                            metric = m.metric.as_str(),
                            granularity = %granularity,
                            end = usage.end,
                            "Usage rejected by window boundary"
                        );
                    }
                }
            }
        }

        Ok(AccumulatedUsage {
            organization_id: usage.organization_id.clone(),
            space_id: usage.space_id.clone(),
            consumer_id: usage.consumer().to_string(),
            resource_id: usage.resource_id.clone(),
            plan_id: usage.plan_id.clone(),
            resource_instance_id: usage.resource_instance_id.clone(),
            account_id: usage.account_id.clone(),
            start: usage.start,
            end: usage.end,
            collected_usage_id: usage.usage_id(),
            processed,
            processed_id,
            metering_plan_id: plans.metering_plan_id.clone(),
            rating_plan_id: plans.rating_plan_id.clone(),
            pricing_plan_id: plans.pricing_plan_id.clone(),
            accumulated_usage: metrics,
        })
    }
}
