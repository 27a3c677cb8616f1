use std::error::Error;
use std::io::Write;

use csv::WriterBuilder;
use ordered_float::NotNan;
use plotters::prelude::*;
use plotters::series::DashedLineSeries;

use crate::metrics::MergedTable;

const YELLOWGREEN: RGBColor = RGBColor(154, 205, 50);
const TEAL: RGBColor = RGBColor(0, 137, 123);
const PURPLE: RGBColor = RGBColor(123, 31, 162);
const DARK_GREEN: RGBColor = RGBColor(27, 94, 32);
const OLIVE: RGBColor = RGBColor(130, 119, 23);
const ORANGE: RGBColor = RGBColor(230, 126, 0);

/// Deterministic output stem: spaces become underscores so e.g.
/// "United Kingdom" in 2021 yields `United_Kingdom_2021`.
pub(crate) fn output_basename(country: &str, year: i32) -> String {
    format!("{}_{}", country.replace(' ', "_"), year)
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => String::new(),
    }
}

pub(crate) fn write_csv(table: &MergedTable, path: &str) -> Result<(), Box<dyn Error>> {
    let file = std::fs::File::create(path)?;
    write_csv_to(table, file)
}

/// Serialize the full merged table, one row per canonical week.
pub(crate) fn write_csv_to<W: Write>(table: &MergedTable, writer: W) -> Result<(), Box<dyn Error>> {
    let mut wtr = WriterBuilder::new().from_writer(writer);

    let mut header = vec!["date".to_string(), "time".to_string()];
    for (year, _) in &table.year_series {
        header.push(format!("deaths_{}_all_ages", year));
    }
    header.extend(
        [
            "new_deaths",
            "deaths_min",
            "deaths_mean",
            "deaths_max",
            "deaths_noncovid",
            "stringency_index",
            "positive_test_percent",
            "people_vaccinated_percent",
            "people_fully_vaccinated_percent",
            "total_boosters_percent",
        ]
        .map(String::from),
    );
    wtr.write_record(&header)?;

    for i in 0..table.dates.len() {
        let mut row = vec![table.dates[i].to_string(), table.weeks[i].to_string()];
        for (_, values) in &table.year_series {
            row.push(fmt_opt(values[i]));
        }
        row.push(fmt_opt(table.covid_deaths[i]));
        row.push(fmt_opt(table.deaths_min[i]));
        row.push(fmt_opt(table.deaths_mean[i]));
        row.push(fmt_opt(table.deaths_max[i]));
        row.push(fmt_opt(table.deaths_noncovid[i]));
        row.push(fmt_opt(table.stringency[i]));
        row.push(fmt_opt(table.positive_test_percent[i]));
        row.push(fmt_opt(table.people_vaccinated_percent[i]));
        row.push(fmt_opt(table.people_fully_vaccinated_percent[i]));
        row.push(fmt_opt(table.total_boosters_percent[i]));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Contiguous known runs of a series as `(week index, value)` polylines, so
/// nulls split a line instead of being bridged. A run of length one is a
/// value flanked by nulls; it is kept and drawn as a point.
fn segments(values: &[Option<f64>]) -> Vec<Vec<(f64, f64)>> {
    let mut segs = Vec::new();
    let mut current: Vec<(f64, f64)> = Vec::new();
    for (i, value) in values.iter().enumerate() {
        match value {
            Some(v) => current.push((i as f64, *v)),
            None => {
                if !current.is_empty() {
                    segs.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        segs.push(current);
    }
    segs
}

/// Closed polygons between the min and max envelope wherever both are known.
fn band_segments(min: &[Option<f64>], max: &[Option<f64>]) -> Vec<Vec<(f64, f64)>> {
    let both: Vec<Option<f64>> = min
        .iter()
        .zip(max)
        .map(|(a, b)| if a.is_some() && b.is_some() { *a } else { None })
        .collect();
    segments(&both)
        .into_iter()
        .map(|lower| {
            let mut polygon = lower.clone();
            for &(x, _) in lower.iter().rev() {
                let i = x as usize;
                if let Some(upper) = max[i] {
                    polygon.push((x, upper));
                }
            }
            polygon
        })
        .collect()
}

/// Upper Y bound shared by every year of the same country, derived from the
/// whole historical span rather than the plotted year.
fn chart_y_max(table: &MergedTable) -> f64 {
    let candidates = table
        .span_max
        .into_iter()
        .chain(table.current_deaths.iter().flatten().copied())
        .chain(table.deaths_max.iter().flatten().copied())
        .chain(table.covid_deaths.iter().flatten().copied());
    let max = candidates
        .filter_map(|v| NotNan::new(v).ok())
        .max()
        .map(NotNan::into_inner)
        .unwrap_or(0.0);
    if max > 0.0 {
        max * 1.05
    } else {
        1.0
    }
}

pub(crate) fn draw_chart(table: &MergedTable, path: &str) -> Result<(), Box<dyn Error>> {
    let n = table.dates.len();
    let x_max = (n.saturating_sub(1)) as f64;
    let y_max = chart_y_max(table);

    let root = BitMapBackend::new(path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("{}, {}", table.country, table.year),
            ("sans-serif", 36),
        )
        .margin(12)
        .x_label_area_size(56)
        .y_label_area_size(72)
        .right_y_label_area_size(56)
        .build_cartesian_2d(0f64..x_max, 0f64..y_max)?
        .set_secondary_coord(0f64..x_max, 0f64..100f64);

    let dates = &table.dates;
    chart
        .configure_mesh()
        .x_labels(n.min(27))
        .x_desc("date")
        .y_desc("number of deaths")
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 12))
        .x_label_formatter(&|x| {
            dates
                .get(x.round() as usize)
                .map(|d| d.format("%d.%m").to_string())
                .unwrap_or_default()
        })
        .draw()?;
    chart
        .configure_secondary_axes()
        .y_desc("percent")
        .axis_desc_style(("sans-serif", 16))
        .draw()?;

    let range = match (table.envelope_years.first(), table.envelope_years.last()) {
        (Some(first), Some(last)) => Some((*first, *last)),
        _ => None,
    };

    if range.is_some() {
        for polygon in band_segments(&table.deaths_min, &table.deaths_max) {
            chart.draw_series(std::iter::once(Polygon::new(
                polygon,
                YELLOWGREEN.mix(0.25).filled(),
            )))?;
        }
    }

    if let Some((first, last)) = range {
        for (i, seg) in segments(&table.deaths_min).iter().enumerate() {
            let anno = if let [point] = seg.as_slice() {
                chart.draw_series(std::iter::once(Circle::new(*point, 2, BLUE.filled())))?
            } else {
                chart.draw_series(DashedLineSeries::new(
                    seg.iter().copied(),
                    3,
                    4,
                    BLUE.stroke_width(1),
                ))?
            };
            if i == 0 {
                anno.label(format!(
                    "lowest death count in {}-{} from all causes",
                    first, last
                ))
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLUE));
            }
        }
        for (i, seg) in segments(&table.deaths_mean).iter().enumerate() {
            let grey = RGBColor(128, 128, 128);
            let anno = if let [point] = seg.as_slice() {
                chart.draw_series(std::iter::once(Circle::new(*point, 2, grey.filled())))?
            } else {
                chart.draw_series(DashedLineSeries::new(
                    seg.iter().copied(),
                    3,
                    4,
                    grey.stroke_width(1),
                ))?
            };
            if i == 0 {
                anno.label(format!(
                    "average death count in {}-{} from all causes",
                    first, last
                ))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], grey));
            }
        }
        for (i, seg) in segments(&table.deaths_max).iter().enumerate() {
            let anno = if let [point] = seg.as_slice() {
                chart.draw_series(std::iter::once(Circle::new(*point, 2, RED.filled())))?
            } else {
                chart.draw_series(DashedLineSeries::new(
                    seg.iter().copied(),
                    3,
                    4,
                    RED.stroke_width(1),
                ))?
            };
            if i == 0 {
                anno.label(format!(
                    "highest death count in {}-{} from all causes",
                    first, last
                ))
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], RED));
            }
        }
    }

    for (i, seg) in segments(&table.current_deaths).iter().enumerate() {
        let anno = if let [point] = seg.as_slice() {
            chart.draw_series(std::iter::once(Circle::new(*point, 2, BLACK.filled())))?
        } else {
            chart.draw_series(LineSeries::new(
                seg.iter().copied(),
                BLACK.stroke_width(2),
            ))?
        };
        if i == 0 {
            anno.label(format!(
                "death count in {} from all causes",
                table.year
            ))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLACK));
        }
    }

    for (i, seg) in segments(&table.deaths_noncovid).iter().enumerate() {
        let anno = if let [point] = seg.as_slice() {
            chart.draw_series(std::iter::once(Circle::new(*point, 2, BLACK.filled())))?
        } else {
            chart.draw_series(DashedLineSeries::new(
                seg.iter().copied(),
                8,
                5,
                BLACK.stroke_width(1),
            ))?
        };
        if i == 0 {
            anno.label(format!(
                "death count in {} from all causes MINUS deaths attributed to COVID-19",
                table.year
            ))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], BLACK));
        }
    }

    let percent_series: [(&[Option<f64>], &str, RGBColor); 5] = [
        (&table.stringency, "policy stringency index", TEAL),
        (&table.positive_test_percent, "positive test percent", PURPLE),
        (
            &table.people_vaccinated_percent,
            "people vaccinated percent",
            DARK_GREEN,
        ),
        (
            &table.people_fully_vaccinated_percent,
            "people fully vaccinated percent",
            OLIVE,
        ),
        (&table.total_boosters_percent, "boosters percent", ORANGE),
    ];
    for (values, label, color) in percent_series {
        for (i, seg) in segments(values).iter().enumerate() {
            let anno = if let [point] = seg.as_slice() {
                chart
                    .draw_secondary_series(std::iter::once(Circle::new(*point, 2, color.filled())))?
            } else {
                chart.draw_secondary_series(LineSeries::new(
                    seg.iter().copied(),
                    color.stroke_width(1),
                ))?
            };
            if i == 0 {
                anno.label(label)
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
            }
        }
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.85))
        .border_style(BLACK)
        .label_font(("sans-serif", 12))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    root.present()?;
    Ok(())
}
