use chrono::{Datelike, Days, NaiveDate, Weekday};
use ulid::Ulid;

/// All dates in `[start, end]` falling on `weekday`, ascending.
pub fn weekday_dates(
    start: NaiveDate,
    end: NaiveDate,
    weekday: Weekday,
) -> impl Iterator<Item = NaiveDate> {
    let offset = (weekday.num_days_from_monday() + 7 - start.weekday().num_days_from_monday()) % 7;
    let first = start.checked_add_days(Days::new(u64::from(offset)));
    std::iter::successors(first, |d| d.checked_add_days(Days::new(7)))
        .take_while(move |d| *d <= end)
}

/// Expand a set of weekday-tagged slots across an inclusive date range into the
/// (slot, date) pairs to book. Dates strictly before `today` are silently
/// skipped — a plan purchased mid-week does not retroactively book past days.
///
/// Pure function: output is date-ascending, then slot-id-ascending, and
/// identical inputs always yield the identical set.
pub fn materialize(
    slots: &[(Ulid, Weekday)],
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Vec<(Ulid, NaiveDate)> {
    let mut out = Vec::new();
    for &(slot_id, weekday) in slots {
        for date in weekday_dates(start, end, weekday) {
            if date >= today {
                out.push((slot_id, date));
            }
        }
    }
    out.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekday_dates_mondays_in_june() {
        let mondays: Vec<_> =
            weekday_dates(date(2024, 6, 3), date(2024, 7, 3), Weekday::Mon).collect();
        assert_eq!(
            mondays,
            vec![
                date(2024, 6, 3),
                date(2024, 6, 10),
                date(2024, 6, 17),
                date(2024, 6, 24),
                date(2024, 7, 1),
            ]
        );
    }

    #[test]
    fn weekday_dates_start_after_weekday() {
        // Range starts on a Wednesday; first Monday is the following week
        let mondays: Vec<_> =
            weekday_dates(date(2024, 6, 5), date(2024, 6, 18), Weekday::Mon).collect();
        assert_eq!(mondays, vec![date(2024, 6, 10), date(2024, 6, 17)]);
    }

    #[test]
    fn weekday_dates_single_day_range() {
        let hits: Vec<_> =
            weekday_dates(date(2024, 6, 3), date(2024, 6, 3), Weekday::Mon).collect();
        assert_eq!(hits, vec![date(2024, 6, 3)]);

        let misses: Vec<_> =
            weekday_dates(date(2024, 6, 3), date(2024, 6, 3), Weekday::Tue).collect();
        assert!(misses.is_empty());
    }

    #[test]
    fn weekday_dates_empty_when_no_match() {
        // Mon..Wed contains no Friday
        let hits: Vec<_> =
            weekday_dates(date(2024, 6, 3), date(2024, 6, 5), Weekday::Fri).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn materialize_skips_dates_before_today() {
        let slot = Ulid::new();
        // Plan runs 2024-06-03..2024-07-03 but is materialized on 2024-06-05:
        // the Monday 2024-06-03 must be skipped.
        let pairs = materialize(
            &[(slot, Weekday::Mon)],
            date(2024, 6, 3),
            date(2024, 7, 3),
            date(2024, 6, 5),
        );
        assert_eq!(
            pairs,
            vec![
                (slot, date(2024, 6, 10)),
                (slot, date(2024, 6, 17)),
                (slot, date(2024, 6, 24)),
                (slot, date(2024, 7, 1)),
            ]
        );
    }

    #[test]
    fn materialize_two_slots_ordering() {
        let mut ids = [Ulid::new(), Ulid::new()];
        ids.sort();
        let [a, b] = ids;
        // b listed first: output must still be date-ascending, then id-ascending
        let pairs = materialize(
            &[(b, Weekday::Wed), (a, Weekday::Mon)],
            date(2024, 6, 3),
            date(2024, 6, 12),
            date(2024, 6, 3),
        );
        assert_eq!(
            pairs,
            vec![
                (a, date(2024, 6, 3)),
                (b, date(2024, 6, 5)),
                (a, date(2024, 6, 10)),
                (b, date(2024, 6, 12)),
            ]
        );
    }

    #[test]
    fn materialize_same_weekday_two_slots() {
        let mut ids = [Ulid::new(), Ulid::new()];
        ids.sort();
        let [a, b] = ids;
        let pairs = materialize(
            &[(b, Weekday::Mon), (a, Weekday::Mon)],
            date(2024, 6, 3),
            date(2024, 6, 10),
            date(2024, 6, 3),
        );
        // Same date → slot-id-ascending
        assert_eq!(
            pairs,
            vec![
                (a, date(2024, 6, 3)),
                (b, date(2024, 6, 3)),
                (a, date(2024, 6, 10)),
                (b, date(2024, 6, 10)),
            ]
        );
    }

    #[test]
    fn materialize_deterministic() {
        let slot = Ulid::new();
        let args = (
            vec![(slot, Weekday::Thu)],
            date(2024, 6, 1),
            date(2024, 6, 30),
            date(2024, 6, 10),
        );
        let first = materialize(&args.0, args.1, args.2, args.3);
        let second = materialize(&args.0, args.1, args.2, args.3);
        assert_eq!(first, second);
    }

    #[test]
    fn materialize_entirely_past_range_is_empty() {
        let slot = Ulid::new();
        let pairs = materialize(
            &[(slot, Weekday::Mon)],
            date(2024, 6, 3),
            date(2024, 6, 17),
            date(2024, 7, 1),
        );
        assert!(pairs.is_empty());
    }
}
