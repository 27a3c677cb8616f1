use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;

/// One day of COVID-19 indicators for one country, as reported in
/// owid-covid-data.csv. Numeric columns are frequently empty in the source,
/// hence `Option` throughout.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CovidRecord {
    pub(crate) location: String,
    pub(crate) date: NaiveDate,
    pub(crate) new_cases_smoothed: Option<f64>,
    pub(crate) new_tests_smoothed: Option<f64>,
    pub(crate) new_deaths: Option<f64>,
    pub(crate) stringency_index: Option<f64>,
    pub(crate) people_vaccinated: Option<f64>,
    pub(crate) people_fully_vaccinated: Option<f64>,
    pub(crate) total_boosters: Option<f64>,
    pub(crate) population: Option<f64>,
}

/// Reporting resolution of a country's mortality rows. Constant per country;
/// a country mixing both is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimeUnit {
    Weekly,
    Monthly,
}

impl TimeUnit {
    pub(crate) fn parse(s: &str) -> Option<TimeUnit> {
        match s {
            "weekly" => Some(TimeUnit::Weekly),
            "monthly" => Some(TimeUnit::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeUnit::Weekly => write!(f, "weekly"),
            TimeUnit::Monthly => write!(f, "monthly"),
        }
    }
}

/// One reporting period (week or month) of all-cause mortality for one
/// country. The `deaths` map holds one entry per `deaths_<year>_all_ages`
/// column found in the input header; the year span is discovered at load
/// time, not hardcoded.
#[derive(Debug, Clone)]
pub(crate) struct MortalityRecord {
    pub(crate) location: String,
    pub(crate) date: NaiveDate,
    /// Week-of-year or month-of-year number, per `time_unit`.
    pub(crate) time: u32,
    pub(crate) time_unit: TimeUnit,
    pub(crate) deaths: BTreeMap<i32, Option<f64>>,
}

#[derive(Debug)]
pub(crate) struct CovidTable {
    pub(crate) rows: Vec<CovidRecord>,
}

#[derive(Debug)]
pub(crate) struct MortalityTable {
    pub(crate) rows: Vec<MortalityRecord>,
    /// Sorted years for which a `deaths_<year>_all_ages` column exists.
    pub(crate) years: Vec<i32>,
}
