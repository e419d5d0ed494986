//! Geo-targeted selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};

/// Filters candidates to a target region before delegating to a base
/// strategy. The region comes from the per-request context, falling back to
/// a configured default; when the filter leaves nothing (or no region is
/// known), the base strategy runs over the unfiltered set.
#[derive(Debug)]
pub struct GeoTargetedStrategy {
    region: Option<String>,
    base: Box<dyn RotationStrategy>,
}

impl GeoTargetedStrategy {
    pub fn new(region: Option<String>, base: Box<dyn RotationStrategy>) -> Self {
        Self { region, base }
    }

    fn matches(proxy: &Proxy, region: &str) -> bool {
        proxy.region.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(region))
            || proxy.country_code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(region))
    }
}

impl RotationStrategy for GeoTargetedStrategy {
    fn name(&self) -> &'static str {
        "geo"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        let Some(region) = ctx.target_region.or(self.region.as_deref()) else {
            return self.base.select(candidates, ctx);
        };

        let matching: Vec<&Proxy> =
            candidates.iter().filter(|p| Self::matches(p, region)).collect();
        if matching.is_empty() {
            tracing::debug!(region, "no proxies match target region, using full pool");
            return self.base.select(candidates, ctx);
        }

        // Delegate over the filtered set, then map back to the caller's
        // slice to keep the returned lifetime tied to `candidates`.
        let filtered: Vec<Proxy> = matching.iter().map(|p| (*p).clone()).collect();
        let picked = self.base.select(&filtered, ctx)?;
        candidates.iter().find(|p| p.id == picked.id)
    }

    fn record_result(&self, proxy: &Proxy, success: bool, response_time_ms: f64) {
        self.base.record_result(proxy, success, response_time_ms);
    }
}
