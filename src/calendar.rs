use chrono::{Datelike, Days, Months, NaiveDate, Weekday};

/// Number of ISO weeks in a year: 52 or 53. By ISO 8601 the 28th of December
/// always falls in the last week of its year.
pub(crate) fn iso_week_count(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 28)
        .expect("December 28 exists in every year")
        .iso_week()
        .week()
}

/// The week-ending Sunday of ISO week `week` of `year`.
pub(crate) fn iso_week_sunday(year: i32, week: u32) -> NaiveDate {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Sun)
        .expect("week number within the ISO week count of its year")
}

/// The first Sunday on or after `date`; identity when `date` is a Sunday.
pub(crate) fn week_ending_sunday(date: NaiveDate) -> NaiveDate {
    let offset = (7 - date.weekday().num_days_from_sunday()) % 7;
    date + Days::new(u64::from(offset))
}

/// Canonical weekly index for `year`: the week-ending Sundays of ISO weeks
/// 1..=iso_week_count(year), followed by the first week-ending Sunday of the
/// next year. The lookahead week makes adjacent-year charts overlap by
/// exactly one week.
pub(crate) fn weekly_index(year: i32) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = (1..=iso_week_count(year))
        .map(|week| iso_week_sunday(year, week))
        .collect();
    dates.push(iso_week_sunday(year + 1, 1));
    dates
}

/// Shift a date by whole years. February 29 clamps to February 28 when the
/// destination year is not a leap year.
pub(crate) fn shift_years(date: NaiveDate, delta: i32) -> NaiveDate {
    let year = date.year() + delta;
    date.with_year(year).unwrap_or_else(|| {
        NaiveDate::from_ymd_opt(year, 2, 28).expect("February 28 exists in every year")
    })
}

/// Move a reference-frame period date into `target_year`'s frame: shift by
/// whole years, then re-snap to the actual week-ending Sunday of the target
/// year. The caller recomputes the ISO week label from the result.
pub(crate) fn realign_week_date(
    date: NaiveDate,
    target_year: i32,
    reference_year: i32,
) -> NaiveDate {
    week_ending_sunday(shift_years(date, target_year - reference_year))
}

/// Last day of the given month.
pub(crate) fn month_end(year: i32, month: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("month in 1..=12");
    first + Months::new(1) - Days::new(1)
}

/// Month-ending dates covering the full span `first_year..=last_year`.
pub(crate) fn month_end_index(first_year: i32, last_year: i32) -> Vec<NaiveDate> {
    (first_year..=last_year)
        .flat_map(|year| (1..=12).map(move |month| month_end(year, month)))
        .collect()
}
