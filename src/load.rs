use std::collections::BTreeMap;
use std::error::Error;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use csv::ReaderBuilder;

use crate::models::{CovidRecord, CovidTable, MortalityRecord, MortalityTable, TimeUnit};

const COVID_COLS: [&str; 10] = [
    "location",
    "date",
    "new_cases_smoothed",
    "new_tests_smoothed",
    "new_deaths",
    "stringency_index",
    "people_vaccinated",
    "people_fully_vaccinated",
    "total_boosters",
    "population",
];

const MORTALITY_BASE_COLS: [&str; 4] = ["location", "date", "time", "time_unit"];

fn check_columns(
    headers: &csv::StringRecord,
    required: &[&str],
    name: &str,
) -> Result<(), Box<dyn Error>> {
    for col in required {
        if !headers.iter().any(|h| h == *col) {
            return Err(format!("required column '{}' is missing from {}", col, name).into());
        }
    }
    Ok(())
}

fn open_input(path: &str) -> Result<std::fs::File, Box<dyn Error>> {
    if !Path::new(path).exists() {
        return Err(format!("input file '{}' not found in the working directory", path).into());
    }
    Ok(std::fs::File::open(path)?)
}

pub(crate) fn load_covid(path: &str) -> Result<CovidTable, Box<dyn Error>> {
    load_covid_from_reader(open_input(path)?, path)
}

pub(crate) fn load_covid_from_reader<R: Read>(
    reader: R,
    name: &str,
) -> Result<CovidTable, Box<dyn Error>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    check_columns(rdr.headers()?, &COVID_COLS, name)?;

    let mut rows: Vec<CovidRecord> = Vec::new();
    for result in rdr.deserialize() {
        let record: CovidRecord = result?;
        rows.push(record);
    }

    Ok(CovidTable { rows })
}

pub(crate) fn load_mortality(path: &str) -> Result<MortalityTable, Box<dyn Error>> {
    load_mortality_from_reader(open_input(path)?, path)
}

/// Year of a `deaths_<YYYY>_all_ages` header, if the header is one.
fn mortality_column_year(header: &str) -> Option<i32> {
    header
        .strip_prefix("deaths_")?
        .strip_suffix("_all_ages")?
        .parse()
        .ok()
}

pub(crate) fn load_mortality_from_reader<R: Read>(
    reader: R,
    name: &str,
) -> Result<MortalityTable, Box<dyn Error>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let index_of = |col: &str| -> Result<usize, Box<dyn Error>> {
        headers
            .iter()
            .position(|h| h == col)
            .ok_or_else(|| format!("required column '{}' is missing from {}", col, name).into())
    };
    let location_idx = index_of(MORTALITY_BASE_COLS[0])?;
    let date_idx = index_of(MORTALITY_BASE_COLS[1])?;
    let time_idx = index_of(MORTALITY_BASE_COLS[2])?;
    let unit_idx = index_of(MORTALITY_BASE_COLS[3])?;

    // The historical year span is whatever the file carries; nothing here
    // assumes 2010-2019.
    let year_cols: Vec<(i32, usize)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| mortality_column_year(h).map(|y| (y, i)))
        .collect();
    if year_cols.is_empty() {
        return Err(format!("no deaths_<year>_all_ages columns found in {}", name).into());
    }

    let mut rows: Vec<MortalityRecord> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let location = record.get(location_idx).unwrap_or("").to_string();
        let raw_date = record.get(date_idx).unwrap_or("");
        let date = match raw_date.parse::<NaiveDate>() {
            Ok(d) => d,
            Err(_) => {
                log::warn!(
                    "{}: skipping '{}' row with unparsable date '{}'",
                    name,
                    location,
                    raw_date
                );
                continue;
            }
        };
        let raw_time = record.get(time_idx).unwrap_or("");
        let time = match raw_time.parse::<u32>() {
            Ok(t) => t,
            Err(_) => {
                log::warn!(
                    "{}: skipping '{}' row with unparsable time '{}'",
                    name,
                    location,
                    raw_time
                );
                continue;
            }
        };
        let raw_unit = record.get(unit_idx).unwrap_or("");
        let time_unit = match TimeUnit::parse(raw_unit) {
            Some(u) => u,
            None => {
                log::warn!(
                    "{}: skipping '{}' row with unrecognized time_unit '{}'",
                    name,
                    location,
                    raw_unit
                );
                continue;
            }
        };

        let mut deaths = BTreeMap::new();
        for &(year, idx) in &year_cols {
            let value = record
                .get(idx)
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse::<f64>().ok());
            deaths.insert(year, value);
        }

        rows.push(MortalityRecord {
            location,
            date,
            time,
            time_unit,
            deaths,
        });
    }

    let mut years: Vec<i32> = year_cols.iter().map(|&(y, _)| y).collect();
    years.sort_unstable();
    years.dedup();

    Ok(MortalityTable { rows, years })
}
