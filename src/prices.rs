use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::slots::SlotGrid;

/// Half-hourly electricity price and site load forecast point.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PricePoint {
    pub slot_start: DateTime<Utc>,
    /// Import price, currency per kWh.
    pub energy_price: f64,
    /// Transmission peak-period flag; charging in these slots is penalized.
    pub triad_flag: bool,
    pub load_forecast_kw: f64,
}

/// Price resolved onto one grid slot.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotPrice {
    pub energy_price: f64,
    pub triad_flag: bool,
    pub load_forecast_kw: f64,
}

pub struct PriceTable {
    data: BTreeMap<DateTime<Utc>, PricePoint>,
}

impl PriceTable {
    pub fn new(points: Vec<PricePoint>) -> Self {
        let mut data = BTreeMap::default();
        for point in points {
            data.insert(point.slot_start, point);
        }
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Price in effect at `time`: the latest point at or before it.
    pub fn at(&self, time: DateTime<Utc>) -> Option<&PricePoint> {
        self.data
            .range(..=time)
            .next_back()
            .map(|(_, point)| point)
    }

    /// Resolves one price per grid slot. Slots before the first known point
    /// fall back to the earliest point; an empty table yields `None`.
    pub fn for_grid(&self, grid: &SlotGrid) -> Option<Vec<SlotPrice>> {
        let first = self.data.values().next()?;
        Some(
            (0..grid.len())
                .map(|i| {
                    let point = self.at(grid.slot_start(i)).unwrap_or(first);
                    SlotPrice {
                        energy_price: point.energy_price,
                        triad_flag: point.triad_flag,
                        load_forecast_kw: point.load_forecast_kw,
                    }
                })
                .collect(),
        )
    }

    /// Price distribution over an interval, in tenths of the smallest
    /// currency unit so the histogram stays integral.
    pub fn histogram_over(&self, range: Range<DateTime<Utc>>) -> Histogram<u64> {
        let mut prices = Histogram::<u64>::new(3).unwrap();
        for (start, point) in self.data.iter() {
            if range.contains(start) {
                let scaled = (point.energy_price * 1000.).max(0.) as u64;
                prices.record(scaled).unwrap();
            }
        }
        prices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn flat_points(start: DateTime<Utc>, n: usize, price: f64) -> Vec<PricePoint> {
        (0..n)
            .map(|i| PricePoint {
                slot_start: start + Duration::minutes(30 * i as i64),
                energy_price: price,
                triad_flag: false,
                load_forecast_kw: 0.0,
            })
            .collect()
    }

    #[test]
    fn at_returns_latest_at_or_before() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let mut points = flat_points(start, 4, 0.10);
        points[2].energy_price = 0.30;
        let table = PriceTable::new(points);

        let mid_slot = start + Duration::minutes(75);
        assert_eq!(table.at(mid_slot).unwrap().energy_price, 0.10);
        let third = start + Duration::minutes(60);
        assert_eq!(table.at(third).unwrap().energy_price, 0.30);
        assert!(table.at(start - Duration::minutes(1)).is_none());
    }

    #[test]
    fn for_grid_resolves_every_slot() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        // half the horizon priced; the rest holds the last value
        let table = PriceTable::new(flat_points(start, 18, 0.12));
        let grid = SlotGrid::new(start, 18);
        let resolved = table.for_grid(&grid).unwrap();
        assert_eq!(resolved.len(), 36);
        assert!(resolved.iter().all(|p| p.energy_price == 0.12));
    }

    #[test]
    fn histogram_quantiles() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let mut points = flat_points(start, 10, 0.10);
        points[9].energy_price = 0.50;
        let table = PriceTable::new(points);
        let hist = table.histogram_over(start..start + Duration::hours(5));
        assert_eq!(hist.len(), 10);
        assert_eq!(hist.value_at_quantile(0.5), 100);
        assert!(hist.value_at_quantile(1.0) >= 500);
    }
}
