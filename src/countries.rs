use std::collections::HashSet;

use itertools::Itertools;

use crate::models::{CovidTable, MortalityTable};

/// Sentinel accepted by `--country` to process every common country in turn.
pub(crate) const ALL_COUNTRIES: &str = "ALL";

/// Countries present in both input tables, sorted by name.
pub(crate) fn common_countries(covid: &CovidTable, mortality: &MortalityTable) -> Vec<String> {
    let covid_set: HashSet<&str> = covid.rows.iter().map(|r| r.location.as_str()).collect();
    mortality
        .rows
        .iter()
        .map(|r| r.location.as_str())
        .filter(|c| covid_set.contains(c))
        .unique()
        .sorted()
        .map(|c| c.to_string())
        .collect()
}

pub(crate) fn country_list_message(countries: &[String]) -> String {
    format!(
        "Please set '--country' to '{}' or one of the following {} countries present in both input datasets: {}.",
        ALL_COUNTRIES,
        countries.len(),
        countries.iter().map(|c| format!("'{}'", c)).join(", ")
    )
}

pub(crate) fn unknown_country_message(country: &str) -> String {
    format!("Country '{}' is not present in both input datasets.\n", country)
}
