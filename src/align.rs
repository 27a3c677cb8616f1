use std::collections::{HashMap, HashSet};
use std::error::Error;

use chrono::{Datelike, NaiveDate};
use ordered_float::NotNan;

use crate::calendar::{
    month_end, month_end_index, realign_week_date, shift_years, week_ending_sunday, weekly_index,
};
use crate::models::{CovidRecord, CovidTable, MortalityRecord, MortalityTable, TimeUnit};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineOptions {
    /// Linear gap-filling across the weekly COVID indicator series.
    pub(crate) interpolate: bool,
    /// Fill week 53 of the historical envelope as mean(week 1, week 52).
    pub(crate) fill_week53: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            interpolate: false,
            fill_week53: true,
        }
    }
}

/// COVID indicator series resampled onto the canonical weekly index.
#[derive(Debug, Clone)]
pub(crate) struct CovidWeekly {
    pub(crate) deaths: Vec<Option<f64>>,
    pub(crate) cases: Vec<Option<f64>>,
    pub(crate) tests: Vec<Option<f64>>,
    pub(crate) stringency: Vec<Option<f64>>,
    pub(crate) vaccinated: Vec<Option<f64>>,
    pub(crate) fully_vaccinated: Vec<Option<f64>>,
    pub(crate) boosters: Vec<Option<f64>>,
    pub(crate) population: Vec<Option<f64>>,
}

/// Everything needed for one (country, year), aligned onto the canonical
/// weekly index: per-year mortality columns, the current-year series, and
/// the resampled COVID indicators.
#[derive(Debug)]
pub(crate) struct AlignedTable {
    pub(crate) country: String,
    pub(crate) year: i32,
    /// First reporting year of the mortality dataset; the calendar frame the
    /// source rows are dated in, and the boundary below which year columns
    /// count as pre-pandemic background.
    pub(crate) reference_year: i32,
    pub(crate) dates: Vec<NaiveDate>,
    pub(crate) weeks: Vec<u32>,
    /// `deaths_<year>_all_ages` columns with at least one value, aligned to
    /// `dates`, ascending by year.
    pub(crate) year_series: Vec<(i32, Vec<Option<f64>>)>,
    /// The requested year's all-cause series; its lookahead entry continues
    /// into the next year so adjacent-year charts overlap by one week.
    pub(crate) current_deaths: Vec<Option<f64>>,
    pub(crate) covid: CovidWeekly,
    /// Largest mortality count anywhere in the historical span, for a
    /// year-independent Y-axis range.
    pub(crate) span_max: Option<f64>,
}

/// Linearly fill interior gaps in place. A run of `None` bounded by known
/// values on both sides is interpolated; leading and trailing gaps are left
/// alone (no extrapolation).
pub(crate) fn interpolate_gaps(values: &mut [Option<f64>]) {
    let known: Vec<usize> = (0..values.len()).filter(|&i| values[i].is_some()).collect();
    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a <= 1 {
            continue;
        }
        if let (Some(va), Some(vb)) = (values[a], values[b]) {
            let step = (vb - va) / (b - a) as f64;
            for i in a + 1..b {
                values[i] = Some(va + step * (i - a) as f64);
            }
        }
    }
}

/// Evaluate a piecewise-linear series defined by sorted `(date, value)`
/// anchors at `at`. Dates outside the anchored range yield `None`.
pub(crate) fn time_interpolate(anchors: &[(NaiveDate, f64)], at: NaiveDate) -> Option<f64> {
    match anchors.binary_search_by_key(&at, |a| a.0) {
        Ok(i) => Some(anchors[i].1),
        Err(0) => None,
        Err(i) if i == anchors.len() => None,
        Err(i) => {
            let (d0, v0) = anchors[i - 1];
            let (d1, v1) = anchors[i];
            let span = (d1 - d0).num_days() as f64;
            let t = (at - d0).num_days() as f64;
            Some(v0 + (v1 - v0) * t / span)
        }
    }
}

/// Fill index 52 (ISO week 53) as the midpoint of week 1 and week 52, for
/// historical series capped at 52 weeks in a 53-week target year. Leaves the
/// value alone unless both ends are known.
pub(crate) fn fill_week53(values: &mut [Option<f64>]) {
    if values.len() < 53 || values[52].is_some() {
        return;
    }
    if let (Some(w1), Some(w52)) = (values[0], values[51]) {
        values[52] = Some((w1 + w52) / 2.0);
    }
}

enum Agg {
    Sum,
    Mean,
}

fn aggregate<I: Iterator<Item = Option<f64>>>(values: I, agg: &Agg) -> Option<f64> {
    let known: Vec<f64> = values.flatten().collect();
    if known.is_empty() {
        return None;
    }
    let sum: f64 = known.iter().sum();
    match agg {
        Agg::Sum => Some(sum),
        Agg::Mean => Some(sum / known.len() as f64),
    }
}

/// Daily flows are summed per bucket, level series averaged; percentage
/// denominators use the population snapshot averaged over the week.
const COVID_FIELDS: [(fn(&CovidRecord) -> Option<f64>, Agg); 8] = [
    (|r| r.new_deaths, Agg::Sum),
    (|r| r.new_cases_smoothed, Agg::Sum),
    (|r| r.new_tests_smoothed, Agg::Sum),
    (|r| r.stringency_index, Agg::Mean),
    (|r| r.people_vaccinated, Agg::Mean),
    (|r| r.people_fully_vaccinated, Agg::Mean),
    (|r| r.total_boosters, Agg::Mean),
    (|r| r.population, Agg::Mean),
];

fn covid_series_from(mut series: Vec<Vec<Option<f64>>>) -> CovidWeekly {
    let population = series.pop().unwrap_or_default();
    let boosters = series.pop().unwrap_or_default();
    let fully_vaccinated = series.pop().unwrap_or_default();
    let vaccinated = series.pop().unwrap_or_default();
    let stringency = series.pop().unwrap_or_default();
    let tests = series.pop().unwrap_or_default();
    let cases = series.pop().unwrap_or_default();
    let deaths = series.pop().unwrap_or_default();
    CovidWeekly {
        deaths,
        cases,
        tests,
        stringency,
        vaccinated,
        fully_vaccinated,
        boosters,
        population,
    }
}

/// Resample daily COVID rows to the canonical weekly index, bucketed on the
/// week-ending Sunday.
fn covid_weekly(rows: &[&CovidRecord], dates: &[NaiveDate]) -> CovidWeekly {
    let mut buckets: HashMap<NaiveDate, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        buckets.entry(week_ending_sunday(row.date)).or_default().push(i);
    }
    let series = COVID_FIELDS
        .iter()
        .map(|(field, agg)| {
            dates
                .iter()
                .map(|d| {
                    buckets
                        .get(d)
                        .and_then(|idx| aggregate(idx.iter().map(|&i| field(rows[i])), agg))
                })
                .collect()
        })
        .collect();
    covid_series_from(series)
}

/// Resample daily COVID rows to monthly bins first, then upsample to the
/// canonical weekly index, so the comparison granularity matches a monthly
/// mortality series.
fn covid_monthly_weekly(rows: &[&CovidRecord], dates: &[NaiveDate]) -> CovidWeekly {
    let mut buckets: HashMap<NaiveDate, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        let anchor = month_end(row.date.year(), row.date.month());
        buckets.entry(anchor).or_default().push(i);
    }
    let series = COVID_FIELDS
        .iter()
        .map(|(field, agg)| {
            let mut anchors: Vec<(NaiveDate, f64)> = buckets
                .iter()
                .filter_map(|(d, idx)| {
                    aggregate(idx.iter().map(|&i| field(rows[i])), agg).map(|v| (*d, v))
                })
                .collect();
            anchors.sort_by_key(|a| a.0);
            dates.iter().map(|d| time_interpolate(&anchors, *d)).collect()
        })
        .collect();
    covid_series_from(series)
}

/// Realign weekly mortality rows from the reference frame into `frame_year`
/// and key them by recomputed ISO week number. Rows landing outside the
/// frame year are dropped.
fn realigned_week_map<'a>(
    rows: &[&'a MortalityRecord],
    frame_year: i32,
    reference_year: i32,
) -> HashMap<u32, &'a MortalityRecord> {
    let mut map = HashMap::new();
    for row in rows {
        let date = realign_week_date(row.date, frame_year, reference_year);
        if date.iso_week().year() == frame_year {
            map.insert(date.iso_week().week(), *row);
        }
    }
    map
}

fn weekly_mortality(
    rows: &[&MortalityRecord],
    years: &[i32],
    year: i32,
    reference_year: i32,
    dates: &[NaiveDate],
    weeks: &[u32],
) -> (Vec<(i32, Vec<Option<f64>>)>, Vec<Option<f64>>) {
    let map_target = realigned_week_map(rows, year, reference_year);
    let map_next = realigned_week_map(rows, year + 1, reference_year);
    let main = dates.len() - 1;

    let column = |y: i32, week: u32, lookahead: bool| -> Option<f64> {
        let map = if lookahead { &map_next } else { &map_target };
        map.get(&week).and_then(|r| r.deaths.get(&y).copied().flatten())
    };

    let mut year_series = Vec::new();
    for &y in years {
        let mut values: Vec<Option<f64>> = weeks[..main]
            .iter()
            .map(|&w| column(y, w, false))
            .collect();
        // Interior gap repair stops at the grid ends; a 52-week-capped
        // historical series in a 53-week year keeps its null week 53 for the
        // envelope fill policy.
        interpolate_gaps(&mut values);
        values.push(column(y, weeks[main], true));
        if values.iter().any(Option::is_some) {
            year_series.push((y, values));
        }
    }

    // The requested year's own series continues into the next year's first
    // week, taken from the next year's column.
    let mut current: Vec<Option<f64>> = weeks[..main]
        .iter()
        .map(|&w| column(year, w, false))
        .collect();
    current.push(column(year + 1, weeks[main], true));
    interpolate_gaps(&mut current);

    (year_series, current)
}

/// Month-end anchors over the whole historical span, concatenating every
/// per-year column into one continuous series.
fn monthly_anchors(rows: &[&MortalityRecord], years: &[i32]) -> Vec<(NaiveDate, f64)> {
    let (Some(&first), Some(&last)) = (years.first(), years.last()) else {
        return Vec::new();
    };
    let mut anchors = Vec::new();
    for date in month_end_index(first, last) {
        let value = rows
            .iter()
            .filter(|r| r.time == date.month())
            .find_map(|r| r.deaths.get(&date.year()).copied().flatten());
        if let Some(v) = value {
            anchors.push((date, v));
        }
    }
    anchors
}

fn monthly_mortality(
    rows: &[&MortalityRecord],
    years: &[i32],
    year: i32,
    dates: &[NaiveDate],
) -> (Vec<(i32, Vec<Option<f64>>)>, Vec<Option<f64>>) {
    let anchors = monthly_anchors(rows, years);
    let main = dates.len() - 1;

    let mut year_series = Vec::new();
    for &y in years {
        // Evaluate each canonical Sunday at the same position of year `y`;
        // the lookahead entry shifts one frame further so it duplicates the
        // next year's first row.
        let values: Vec<Option<f64>> = dates
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let delta = if i == main { y - year - 1 } else { y - year };
                time_interpolate(&anchors, shift_years(d, delta))
            })
            .collect();
        if values.iter().any(Option::is_some) {
            year_series.push((y, values));
        }
    }

    let current: Vec<Option<f64>> = dates
        .iter()
        .map(|&d| time_interpolate(&anchors, d))
        .collect();

    (year_series, current)
}

/// Largest all-cause count across every year column of the country's rows.
/// Interpolated values never exceed their anchors, so the raw maximum bounds
/// the whole reconstructed span.
fn historical_span_max(rows: &[&MortalityRecord]) -> Option<f64> {
    rows.iter()
        .flat_map(|r| r.deaths.values().copied())
        .filter_map(|v| v.and_then(|v| NotNan::new(v).ok()))
        .max()
        .map(NotNan::into_inner)
}

pub(crate) fn align_country_year(
    covid: &CovidTable,
    mortality: &MortalityTable,
    country: &str,
    year: i32,
    opts: &PipelineOptions,
) -> Result<AlignedTable, Box<dyn Error>> {
    let covid_rows: Vec<&CovidRecord> = covid
        .rows
        .iter()
        .filter(|r| r.location == country)
        .collect();
    let mortality_rows: Vec<&MortalityRecord> = mortality
        .rows
        .iter()
        .filter(|r| r.location == country)
        .collect();
    if covid_rows.is_empty() || mortality_rows.is_empty() {
        return Err(format!("country '{}' is missing from one of the inputs", country).into());
    }

    let units: HashSet<TimeUnit> = mortality_rows.iter().map(|r| r.time_unit).collect();
    if units.len() != 1 {
        return Err(format!(
            "country '{}' mixes weekly and monthly mortality rows; a single time_unit is required",
            country
        )
        .into());
    }
    let time_unit = mortality_rows[0].time_unit;

    let reference_year = mortality_rows
        .iter()
        .map(|r| match time_unit {
            TimeUnit::Weekly => r.date.iso_week().year(),
            TimeUnit::Monthly => r.date.year(),
        })
        .min()
        .ok_or("no mortality rows")?;

    let dates = weekly_index(year);
    let weeks: Vec<u32> = dates.iter().map(|d| d.iso_week().week()).collect();

    let (year_series, current_deaths) = match time_unit {
        TimeUnit::Weekly => weekly_mortality(
            &mortality_rows,
            &mortality.years,
            year,
            reference_year,
            &dates,
            &weeks,
        ),
        TimeUnit::Monthly => monthly_mortality(&mortality_rows, &mortality.years, year, &dates),
    };

    let mut covid_series = match time_unit {
        TimeUnit::Weekly => covid_weekly(&covid_rows, &dates),
        TimeUnit::Monthly => covid_monthly_weekly(&covid_rows, &dates),
    };

    if opts.interpolate {
        for series in [
            &mut covid_series.cases,
            &mut covid_series.tests,
            &mut covid_series.stringency,
            &mut covid_series.vaccinated,
            &mut covid_series.fully_vaccinated,
            &mut covid_series.boosters,
            &mut covid_series.population,
        ] {
            interpolate_gaps(series);
        }
    }

    let span_max = historical_span_max(&mortality_rows);

    Ok(AlignedTable {
        country: country.to_string(),
        year,
        reference_year,
        dates,
        weeks,
        year_series,
        current_deaths,
        covid: covid_series,
        span_max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn interior_gaps_fill_ends_stay_null() {
        let mut values = vec![None, Some(10.0), None, None, Some(40.0), None];
        interpolate_gaps(&mut values);
        assert_eq!(
            values,
            vec![None, Some(10.0), Some(20.0), Some(30.0), Some(40.0), None]
        );
    }

    #[test]
    fn single_point_gap_needs_both_neighbors() {
        let mut values = vec![Some(1.0), None];
        interpolate_gaps(&mut values);
        assert_eq!(values, vec![Some(1.0), None]);

        let mut values = vec![None, Some(1.0)];
        interpolate_gaps(&mut values);
        assert_eq!(values, vec![None, Some(1.0)]);

        let mut values = vec![Some(1.0), None, Some(3.0)];
        interpolate_gaps(&mut values);
        assert_eq!(values, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn time_interpolation_is_linear_in_days() {
        let anchors = vec![(d(2020, 1, 31), 100.0), (d(2020, 2, 29), 129.0)];
        assert_eq!(time_interpolate(&anchors, d(2020, 1, 31)), Some(100.0));
        assert_eq!(time_interpolate(&anchors, d(2020, 2, 10)), Some(110.0));
        assert_eq!(time_interpolate(&anchors, d(2020, 2, 29)), Some(129.0));
        // No extrapolation past the anchored range.
        assert_eq!(time_interpolate(&anchors, d(2020, 1, 30)), None);
        assert_eq!(time_interpolate(&anchors, d(2020, 3, 1)), None);
    }

    #[test]
    fn week53_fill_is_the_week1_week52_midpoint() {
        let mut values: Vec<Option<f64>> = (0..54).map(|_| None).collect();
        values[0] = Some(100.0);
        values[51] = Some(140.0);
        fill_week53(&mut values);
        assert_eq!(values[52], Some(120.0));

        // Known values are left alone.
        let mut values: Vec<Option<f64>> = (0..54).map(|i| Some(i as f64)).collect();
        fill_week53(&mut values);
        assert_eq!(values[52], Some(52.0));
    }

    #[test]
    fn week53_fill_requires_both_ends() {
        let mut values: Vec<Option<f64>> = (0..54).map(|_| None).collect();
        values[51] = Some(140.0);
        fill_week53(&mut values);
        assert_eq!(values[52], None);
    }

    fn monthly_row(month: u32, deaths: &[(i32, f64)]) -> MortalityRecord {
        MortalityRecord {
            location: "Germany".into(),
            date: month_end(2020, month),
            time: month,
            time_unit: TimeUnit::Monthly,
            deaths: deaths.iter().map(|&(y, v)| (y, Some(v))).collect(),
        }
    }

    fn monthly_rows() -> Vec<MortalityRecord> {
        (1..=12)
            .map(|m| {
                let d2019 = if m == 12 { 1170.0 } else { 1100.0 + m as f64 };
                monthly_row(
                    m,
                    &[
                        (2015, 800.0 + m as f64),
                        (2019, d2019),
                        (2020, 1200.0 + m as f64),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn monthly_series_interpolate_between_month_ends() {
        let rows = monthly_rows();
        let refs: Vec<&MortalityRecord> = rows.iter().collect();
        let years = vec![2015, 2019, 2020];
        let dates = weekly_index(2020);
        let (year_series, current) = monthly_mortality(&refs, &years, 2020, &dates);

        // 2020-05-31 is both a month end and a canonical Sunday (week 22),
        // so the May anchor value comes through exactly.
        assert_eq!(dates[21], d(2020, 5, 31));
        assert_eq!(current[21], Some(1205.0));
        // 2020-01-05 sits 5 of 31 days past the 2019-12-31 anchor (1170),
        // heading for 1201 at 2020-01-31.
        assert_eq!(current[0], Some(1175.0));
        // Anchors end at 2020-12-31; the lookahead Sunday is past them.
        assert_eq!(current[53], None);

        let y2019 = &year_series.iter().find(|(y, _)| *y == 2019).unwrap().1;
        assert_eq!(y2019[21], Some(1105.0));
        let y2015 = &year_series.iter().find(|(y, _)| *y == 2015).unwrap().1;
        assert_eq!(y2015[21], Some(805.0));
    }

    #[test]
    fn monthly_lookahead_duplicates_next_years_first_row() {
        let rows = monthly_rows();
        let refs: Vec<&MortalityRecord> = rows.iter().collect();
        let years = vec![2015, 2019, 2020];
        let (series_2020, current_2020) =
            monthly_mortality(&refs, &years, 2020, &weekly_index(2020));
        let (series_2021, current_2021) =
            monthly_mortality(&refs, &years, 2021, &weekly_index(2021));

        // The last row of the 2020 chart is the first row of the 2021 chart,
        // column by column.
        let last = series_2020[0].1.len() - 1;
        for ((y20, v20), (y21, v21)) in series_2020.iter().zip(&series_2021) {
            assert_eq!(y20, y21);
            assert_eq!(v20[last], v21[0]);
        }
        assert_eq!(current_2020[last], current_2021[0]);
    }

    #[test]
    fn covid_monthly_resampling_goes_through_month_bins() {
        let mut rows: Vec<CovidRecord> = Vec::new();
        for day in 1..=31u32 {
            rows.push(CovidRecord {
                location: "Germany".into(),
                date: d(2020, 3, day),
                new_cases_smoothed: None,
                new_tests_smoothed: None,
                new_deaths: if day <= 30 { Some(2.0) } else { None },
                stringency_index: Some(50.0),
                people_vaccinated: None,
                people_fully_vaccinated: None,
                total_boosters: None,
                population: Some(1000.0),
            });
        }
        for day in 1..=30u32 {
            rows.push(CovidRecord {
                location: "Germany".into(),
                date: d(2020, 4, day),
                new_cases_smoothed: None,
                new_tests_smoothed: None,
                new_deaths: Some(3.0),
                stringency_index: Some(50.0),
                people_vaccinated: None,
                people_fully_vaccinated: None,
                total_boosters: None,
                population: Some(1000.0),
            });
        }
        let refs: Vec<&CovidRecord> = rows.iter().collect();
        // March deaths sum to 60 at the 2020-03-31 anchor, April to 90 at
        // 2020-04-30; weekly values are read off the line between them.
        let dates = vec![d(2020, 3, 1), d(2020, 4, 5)];
        let weekly = covid_monthly_weekly(&refs, &dates);
        assert_eq!(weekly.deaths[0], None);
        assert_eq!(weekly.deaths[1], Some(65.0));
        assert_eq!(weekly.stringency[1], Some(50.0));
        assert_eq!(weekly.population[1], Some(1000.0));
    }

    #[test]
    fn mixed_time_units_are_rejected() {
        let covid = CovidTable {
            rows: vec![CovidRecord {
                location: "Germany".into(),
                date: d(2020, 3, 2),
                new_cases_smoothed: None,
                new_tests_smoothed: None,
                new_deaths: Some(1.0),
                stringency_index: None,
                people_vaccinated: None,
                people_fully_vaccinated: None,
                total_boosters: None,
                population: Some(1000.0),
            }],
        };
        let mut rows = monthly_rows();
        rows.push(MortalityRecord {
            location: "Germany".into(),
            date: d(2020, 1, 5),
            time: 1,
            time_unit: TimeUnit::Weekly,
            deaths: [(2020, Some(8000.0))].into_iter().collect(),
        });
        let mortality = MortalityTable {
            rows,
            years: vec![2015, 2019, 2020],
        };
        let err = align_country_year(
            &covid,
            &mortality,
            "Germany",
            2020,
            &PipelineOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("single time_unit"));
    }

    #[test]
    fn weekly_aggregation_sums_flows_and_averages_levels() {
        let rows: Vec<CovidRecord> = (0u64..7)
            .map(|i| CovidRecord {
                location: "Poland".into(),
                date: d(2020, 3, 2) + chrono::Days::new(i),
                new_cases_smoothed: Some(10.0),
                new_tests_smoothed: Some(100.0),
                new_deaths: Some(2.0),
                stringency_index: Some(50.0),
                people_vaccinated: None,
                people_fully_vaccinated: None,
                total_boosters: None,
                population: Some(1000.0),
            })
            .collect();
        let refs: Vec<&CovidRecord> = rows.iter().collect();
        // 2020-03-02 is a Monday; the whole run lands in the week ending
        // Sunday 2020-03-08.
        let dates = vec![d(2020, 3, 8)];
        let weekly = covid_weekly(&refs, &dates);
        assert_eq!(weekly.deaths, vec![Some(14.0)]);
        assert_eq!(weekly.cases, vec![Some(70.0)]);
        assert_eq!(weekly.stringency, vec![Some(50.0)]);
        assert_eq!(weekly.population, vec![Some(1000.0)]);
        assert_eq!(weekly.vaccinated, vec![None]);
    }
}
