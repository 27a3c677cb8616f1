use chrono::NaiveDate;
use ndarray::Array2;
use statrs::statistics::Statistics;

use crate::align::{fill_week53, AlignedTable, PipelineOptions};

/// The output entity: one row per canonical week, ready to chart and to
/// serialize.
#[derive(Debug)]
pub(crate) struct MergedTable {
    pub(crate) country: String,
    pub(crate) year: i32,
    pub(crate) dates: Vec<NaiveDate>,
    pub(crate) weeks: Vec<u32>,
    /// Per-year mortality columns carried through to the CSV.
    pub(crate) year_series: Vec<(i32, Vec<Option<f64>>)>,
    /// Pre-pandemic years contributing to the envelope, ascending.
    pub(crate) envelope_years: Vec<i32>,
    pub(crate) deaths_min: Vec<Option<f64>>,
    pub(crate) deaths_mean: Vec<Option<f64>>,
    pub(crate) deaths_max: Vec<Option<f64>>,
    pub(crate) current_deaths: Vec<Option<f64>>,
    pub(crate) covid_deaths: Vec<Option<f64>>,
    pub(crate) deaths_noncovid: Vec<Option<f64>>,
    pub(crate) stringency: Vec<Option<f64>>,
    pub(crate) positive_test_percent: Vec<Option<f64>>,
    pub(crate) people_vaccinated_percent: Vec<Option<f64>>,
    pub(crate) people_fully_vaccinated_percent: Vec<Option<f64>>,
    pub(crate) total_boosters_percent: Vec<Option<f64>>,
    pub(crate) span_max: Option<f64>,
}

fn sub(a: &[Option<f64>], b: &[Option<f64>]) -> Vec<Option<f64>> {
    a.iter()
        .zip(b)
        .map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => Some(a - b),
            _ => None,
        })
        .collect()
}

/// `numerator / denominator * 100`, null on a null or zero denominator.
fn percent_of(numerator: &[Option<f64>], denominator: &[Option<f64>]) -> Vec<Option<f64>> {
    numerator
        .iter()
        .zip(denominator)
        .map(|(n, d)| match (n, d) {
            (Some(n), Some(d)) if *d != 0.0 => Some(n / d * 100.0),
            _ => None,
        })
        .collect()
}

/// Row-wise min/mean/max across the pre-pandemic year columns. Years with no
/// data at all never made it into `year_series`, so they cannot skew the
/// envelope.
fn envelope(
    matrix: &Array2<f64>,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let weeks = matrix.ncols();
    let mut minima = Vec::with_capacity(weeks);
    let mut means = Vec::with_capacity(weeks);
    let mut maxima = Vec::with_capacity(weeks);
    for j in 0..weeks {
        let column = matrix.column(j);
        let known: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        if known.is_empty() {
            minima.push(None);
            means.push(None);
            maxima.push(None);
        } else {
            minima.push(Some(known.iter().copied().fold(f64::INFINITY, f64::min)));
            maxima.push(Some(known.iter().copied().fold(f64::NEG_INFINITY, f64::max)));
            means.push(Some(known.iter().mean()));
        }
    }
    (minima, means, maxima)
}

pub(crate) fn derive_metrics(aligned: AlignedTable, opts: &PipelineOptions) -> MergedTable {
    let n = aligned.dates.len();

    let envelope_rows: Vec<&(i32, Vec<Option<f64>>)> = aligned
        .year_series
        .iter()
        .filter(|(y, _)| *y < aligned.reference_year)
        .collect();
    let envelope_years: Vec<i32> = envelope_rows.iter().map(|(y, _)| *y).collect();

    let mut matrix = Array2::<f64>::from_elem((envelope_rows.len(), n), f64::NAN);
    for (i, (_, values)) in envelope_rows.iter().enumerate() {
        for (j, value) in values.iter().enumerate() {
            if let Some(v) = value {
                matrix[[i, j]] = *v;
            }
        }
    }
    let (mut deaths_min, mut deaths_mean, mut deaths_max) = envelope(&matrix);

    // Historical columns stop at week 52; in a 53-week year the envelope gets
    // week 53 filled as the week 1 / week 52 midpoint unless disabled.
    if opts.fill_week53 && n == 54 {
        fill_week53(&mut deaths_min);
        fill_week53(&mut deaths_mean);
        fill_week53(&mut deaths_max);
    }

    let deaths_noncovid = sub(&aligned.current_deaths, &aligned.covid.deaths);
    let positive_test_percent = percent_of(&aligned.covid.cases, &aligned.covid.tests);
    let people_vaccinated_percent =
        percent_of(&aligned.covid.vaccinated, &aligned.covid.population);
    let people_fully_vaccinated_percent =
        percent_of(&aligned.covid.fully_vaccinated, &aligned.covid.population);
    let total_boosters_percent = percent_of(&aligned.covid.boosters, &aligned.covid.population);

    MergedTable {
        country: aligned.country,
        year: aligned.year,
        dates: aligned.dates,
        weeks: aligned.weeks,
        year_series: aligned.year_series,
        envelope_years,
        deaths_min,
        deaths_mean,
        deaths_max,
        current_deaths: aligned.current_deaths,
        covid_deaths: aligned.covid.deaths,
        deaths_noncovid,
        stringency: aligned.covid.stringency,
        positive_test_percent,
        people_vaccinated_percent,
        people_fully_vaccinated_percent,
        total_boosters_percent,
        span_max: aligned.span_max,
    }
}
