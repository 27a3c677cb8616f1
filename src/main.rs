mod align;
mod calendar;
mod countries;
mod load;
mod metrics;
mod models;
mod render;

use std::error::Error;
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgGroup, Command};
use simple_logger::SimpleLogger;

use crate::align::PipelineOptions;
use crate::countries::{common_countries, country_list_message, unknown_country_message, ALL_COUNTRIES};
use crate::metrics::derive_metrics;
use crate::models::{CovidTable, MortalityTable};
use crate::render::{draw_chart, output_basename, write_csv};

const COVID_INPUT: &str = "owid-covid-data.csv";
const MORTALITY_INPUT: &str = "excess_mortality.csv";

fn cli() -> Command {
    Command::new("covid_toll")
        .about(
            "Compare all-cause mortality with its pre-pandemic envelope and \
             COVID-19 deaths, one chart and CSV per country and year",
        )
        .arg(
            Arg::new("list_countries")
                .long("list_countries")
                .action(ArgAction::SetTrue)
                .help("List the countries present in both input datasets and exit"),
        )
        .arg(
            Arg::new("country")
                .long("country")
                .value_name("NAME")
                .requires("year")
                .help(format!(
                    "Country to process, or '{}' for every country present in both datasets",
                    ALL_COUNTRIES
                )),
        )
        .arg(
            Arg::new("year")
                .long("year")
                .value_name("YEAR")
                .value_parser(clap::value_parser!(i32))
                .requires("country")
                .conflicts_with("list_countries")
                .help("Calendar year to chart"),
        )
        .arg(
            Arg::new("interpolate")
                .long("interpolate")
                .action(ArgAction::SetTrue)
                .conflicts_with("list_countries")
                .help("Linearly fill interior gaps in the COVID-19 context series"),
        )
        .arg(
            Arg::new("no_week53_fill")
                .long("no_week53_fill")
                .action(ArgAction::SetTrue)
                .conflicts_with("list_countries")
                .help("Leave envelope week 53 empty instead of filling it from weeks 1 and 52"),
        )
        .group(
            ArgGroup::new("mode")
                .args(["list_countries", "country"])
                .required(true),
        )
}

fn process_country(
    covid: &CovidTable,
    mortality: &MortalityTable,
    country: &str,
    year: i32,
    opts: &PipelineOptions,
) -> Result<(), Box<dyn Error>> {
    let aligned = align::align_country_year(covid, mortality, country, year, opts)?;
    let merged = derive_metrics(aligned, opts);

    let basename = output_basename(country, year);
    let png_path = format!("{}.png", basename);
    let csv_path = format!("{}.csv", basename);
    draw_chart(&merged, &png_path)?;
    write_csv(&merged, &csv_path)?;
    println!("Wrote {} and {}.", png_path, csv_path);
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();

    let covid = load::load_covid(COVID_INPUT)?;
    let mortality = load::load_mortality(MORTALITY_INPUT)?;
    let common = common_countries(&covid, &mortality);

    if matches.get_flag("list_countries") {
        println!("{}", country_list_message(&common));
        return Ok(());
    }

    // The mode group plus the country/year requirements guarantee both are
    // present past this point; the parser already reported anything else.
    let country = matches
        .get_one::<String>("country")
        .ok_or("'--country' is required unless '--list_countries' is given")?;
    let year = *matches
        .get_one::<i32>("year")
        .ok_or("'--year' is required together with '--country'")?;

    let opts = PipelineOptions {
        interpolate: matches.get_flag("interpolate"),
        fill_week53: !matches.get_flag("no_week53_fill"),
    };

    if country == ALL_COUNTRIES {
        for country in &common {
            if let Err(err) = process_country(&covid, &mortality, country, year, &opts) {
                log::warn!("skipping '{}' for {}: {}", country, year, err);
            }
        }
        return Ok(());
    }

    if !common.iter().any(|c| c == country) {
        print!("{}", unknown_country_message(country));
        println!("{}", country_list_message(&common));
        return Ok(());
    }

    process_country(&covid, &mortality, country, year, &opts)
}

fn main() -> ExitCode {
    SimpleLogger::new().init().unwrap();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}


#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::calendar::iso_week_sunday;
    use crate::load::{load_covid_from_reader, load_mortality_from_reader};
    use crate::render::write_csv_to;

    fn fixtures() -> (CovidTable, MortalityTable) {
        let mut covid = String::from(
            "location,date,new_cases_smoothed,new_tests_smoothed,new_deaths,\
             stringency_index,people_vaccinated,people_fully_vaccinated,\
             total_boosters,population\n",
        );
        for day in 1..=31 {
            covid.push_str(&format!(
                "Poland,2020-03-{:02},120,1000,{},55.5,,,,38000000\n",
                day, day
            ));
        }

        let mut mortality = String::from(
            "location,date,time,time_unit,deaths_2015_all_ages,\
             deaths_2019_all_ages,deaths_2020_all_ages\n",
        );
        for week in 1..=53u32 {
            let date = iso_week_sunday(2020, week);
            // Historical columns stop at week 52, as the source data does.
            let (d2015, d2019) = if week <= 52 {
                (format!("{}", 7000 + week), format!("{}", 7500 + week))
            } else {
                (String::new(), String::new())
            };
            mortality.push_str(&format!(
                "Poland,{},{},weekly,{},{},{}\n",
                date,
                week,
                d2015,
                d2019,
                8000 + week
            ));
        }

        (
            load_covid_from_reader(covid.as_bytes(), "covid").unwrap(),
            load_mortality_from_reader(mortality.as_bytes(), "mortality").unwrap(),
        )
    }

    #[test]
    fn poland_2020_spans_fifty_four_weeks() {
        let (covid, mortality) = fixtures();
        let opts = PipelineOptions::default();
        let aligned =
            align::align_country_year(&covid, &mortality, "Poland", 2020, &opts).unwrap();
        assert_eq!(aligned.dates.len(), 54);
        assert_eq!(aligned.weeks[0], 1);
        assert_eq!(aligned.weeks[52], 53);
        // Lookahead row belongs to week 1 of 2021.
        assert_eq!(aligned.weeks[53], 1);
        assert_eq!(aligned.reference_year, 2020);
        assert_eq!(aligned.current_deaths[0], Some(8001.0));
        assert_eq!(aligned.current_deaths[52], Some(8053.0));
    }

    #[test]
    fn envelope_covers_week_53_by_default() {
        let (covid, mortality) = fixtures();
        let opts = PipelineOptions::default();
        let aligned =
            align::align_country_year(&covid, &mortality, "Poland", 2020, &opts).unwrap();
        let merged = derive_metrics(aligned, &opts);
        assert_eq!(merged.envelope_years, vec![2015, 2019]);
        assert_eq!(merged.deaths_min[0], Some(7001.0));
        assert_eq!(merged.deaths_max[0], Some(7501.0));
        // Week 53 fill: midpoint of the year's weeks 1 and 52.
        assert_eq!(merged.deaths_min[52], Some((7001.0 + 7052.0) / 2.0));
        assert_eq!(merged.deaths_max[52], Some((7501.0 + 7552.0) / 2.0));

        let opts = PipelineOptions {
            fill_week53: false,
            ..PipelineOptions::default()
        };
        let aligned =
            align::align_country_year(&covid, &mortality, "Poland", 2020, &opts).unwrap();
        let merged = derive_metrics(aligned, &opts);
        assert_eq!(merged.deaths_min[52], None);
    }

    #[test]
    fn csv_output_is_byte_deterministic() {
        let (covid, mortality) = fixtures();
        let opts = PipelineOptions::default();
        let render = || {
            let aligned =
                align::align_country_year(&covid, &mortality, "Poland", 2020, &opts).unwrap();
            let merged = derive_metrics(aligned, &opts);
            let mut buf = Vec::new();
            write_csv_to(&merged, &mut buf).unwrap();
            buf
        };
        let first = render();
        let second = render();
        assert!(!first.is_empty());
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("date,time,deaths_2015_all_ages"));
        assert!(header.contains("deaths_noncovid"));
        assert!(header.ends_with("total_boosters_percent"));
        assert_eq!(lines.count(), 54);
    }

    #[test]
    fn unknown_country_is_reported_against_the_common_list() {
        let (covid, mortality) = fixtures();
        let common = common_countries(&covid, &mortality);
        assert_eq!(common, vec!["Poland"]);
        assert!(!common.iter().any(|c| c == "Narnia"));
        assert!(unknown_country_message("Narnia").contains("'Narnia'"));
    }
}
