//! Operation schedule parsing from the help page
//!
//! `HelpController` renders the election calendar as datagrid tables with
//! free-form datetime text. Phases are matched by column headers, and the
//! timestamps accept both ISO-ish (`2026-02-27 15:00`) and Chinese
//! (`2月27日下午3:00`) forms, with a year-rollover heuristic for entries
//! that omit the year around New Year.

use chrono::{Datelike, Local, NaiveDate, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// One row of the election calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePhase {
    pub name: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

static SEL_DATAGRID: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table.datagrid").expect("static selector"));
static SEL_HEADER_TH: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr.datagrid-header th").expect("static selector"));
static SEL_ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr.datagrid-odd, tr.datagrid-even").expect("static selector"));

static RE_ISO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<y>\d{4})[-/](?P<m>\d{1,2})[-/](?P<d>\d{1,2})\s+(?P<h>\d{1,2}):(?P<min>\d{2})")
        .expect("static regex")
});
static RE_CN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?P<y>\d{4})年)?(?P<m>\d{1,2})月(?P<d>\d{1,2})日(?:(?P<ap>上午|下午|晚上|中午))?(?P<h>\d{1,2}):(?P<min>\d{2})",
    )
    .expect("static regex")
});

fn local_ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> Option<i64> {
    let date = NaiveDate::from_ymd_opt(y, m, d)?;
    let dt = date.and_hms_opt(h, min, 0)?;
    Local.from_local_datetime(&dt).earliest().map(|t| t.timestamp())
}

/// Parse a schedule datetime into a local epoch timestamp. `now_ts` anchors
/// the year for Chinese dates that omit it.
#[must_use]
pub fn parse_datetime(text: &str, now_ts: i64) -> Option<i64> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(caps) = RE_ISO.captures(s) {
        let y = caps["y"].parse().ok()?;
        let m = caps["m"].parse().ok()?;
        let d = caps["d"].parse().ok()?;
        let h = caps["h"].parse().ok()?;
        let min = caps["min"].parse().ok()?;
        return local_ts(y, m, d, h, min);
    }
    let caps = RE_CN.captures(s)?;
    let now = Local.timestamp_opt(now_ts, 0).earliest()?;
    let y: i32 = match caps.name("y") {
        Some(m) => m.as_str().parse().ok()?,
        None => now.year(),
    };
    let m: u32 = caps["m"].parse().ok()?;
    let d: u32 = caps["d"].parse().ok()?;
    let mut h: u32 = caps["h"].parse().ok()?;
    let min: u32 = caps["min"].parse().ok()?;
    let ap = caps.name("ap").map_or("", |m| m.as_str());
    if matches!(ap, "下午" | "晚上" | "中午") && h < 12 {
        h += 12;
    }
    let mut ts = local_ts(y, m, d, h, min)?;
    // Year rollover: a December entry read in January points at next year.
    if ts < now_ts - 7 * 86_400 && m < now.month() {
        ts = local_ts(y + 1, m, d, h, min)?;
    }
    Some(ts)
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("")
}

fn find_col(header: &[String], keywords: &[&str]) -> Option<usize> {
    for kw in keywords {
        if let Some(ix) = header.iter().position(|h| h.contains(kw)) {
            return Some(ix);
        }
    }
    None
}

fn row_cells<'a>(row: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| {
            let name = el.value().name();
            name == "th" || name == "td"
        })
        .collect()
}

/// Parse the election calendar out of a help page body. Tables without a
/// recognizable start/end column are skipped; rows that fail to parse are
/// dropped silently (the cache simply stays sparse).
#[must_use]
pub fn parse_help_schedule(html: &str, now_ts: i64) -> Vec<SchedulePhase> {
    let doc = Html::parse_document(html);
    let mut phases = Vec::new();
    for table in doc.select(&SEL_DATAGRID) {
        let header: Vec<String> = table.select(&SEL_HEADER_TH).map(|th| cell_text(th)).collect();
        if header.is_empty() {
            continue;
        }
        let Some(start_ix) = find_col(&header, &["开始时间", "开始"]) else {
            continue;
        };
        let Some(end_ix) = find_col(&header, &["结束时间", "结束"]) else {
            continue;
        };
        let name_ix = find_col(&header, &["项目", "阶段", "选课阶段", "内容"]).unwrap_or(0);

        for row in table.select(&SEL_ROWS) {
            let cells = row_cells(row);
            let (Some(name_cell), Some(start_cell), Some(end_cell)) =
                (cells.get(name_ix), cells.get(start_ix), cells.get(end_ix))
            else {
                continue;
            };
            let name = cell_text(*name_cell);
            let start_ts = parse_datetime(&cell_text(*start_cell), now_ts);
            let end_ts = parse_datetime(&cell_text(*end_cell), now_ts);
            if let (false, Some(start_ts), Some(end_ts)) = (name.is_empty(), start_ts, end_ts) {
                phases.push(SchedulePhase {
                    name,
                    start_ts,
                    end_ts,
                });
            }
        }
    }
    phases
}

/// The next supplementary phase that has not started yet.
#[must_use]
pub fn find_next_operation_start(now_ts: i64, phases: &[SchedulePhase]) -> Option<&SchedulePhase> {
    phases
        .iter()
        .filter(|p| p.start_ts > now_ts)
        .filter(|p| ["补退选", "候补", "补选"].iter().any(|kw| p.name.contains(kw)))
        .min_by_key(|p| p.start_ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        local_ts(y, m, d, h, min).unwrap()
    }

    #[test]
    fn test_parse_iso_datetime() {
        let now = ts(2026, 2, 1, 0, 0);
        assert_eq!(
            parse_datetime("2026-02-27 15:00", now),
            Some(ts(2026, 2, 27, 15, 0))
        );
        assert_eq!(
            parse_datetime("2026/03/01 09:30", now),
            Some(ts(2026, 3, 1, 9, 30))
        );
    }

    #[test]
    fn test_parse_cn_datetime_afternoon() {
        let now = ts(2026, 2, 1, 0, 0);
        assert_eq!(
            parse_datetime("2月27日下午3:00", now),
            Some(ts(2026, 2, 27, 15, 0))
        );
        assert_eq!(
            parse_datetime("2026年2月27日上午9:00", now),
            Some(ts(2026, 2, 27, 9, 0))
        );
    }

    #[test]
    fn test_year_rollover() {
        // Reading "1月5日" in late December must land in next January.
        let now = ts(2026, 12, 28, 0, 0);
        assert_eq!(parse_datetime("1月5日上午8:00", now), Some(ts(2027, 1, 5, 8, 0)));
    }

    #[test]
    fn test_parse_help_schedule_table() {
        let now = ts(2026, 2, 1, 0, 0);
        let html = r#"<html><body>
          <table class="datagrid">
            <tr class="datagrid-header"><th>选课阶段</th><th>开始时间</th><th>结束时间</th></tr>
            <tr class="datagrid-odd"><td>第一轮预选</td><td>2026-02-10 09:00</td><td>2026-02-12 18:00</td></tr>
            <tr class="datagrid-even"><td>补退选阶段</td><td>2026-02-27 15:00</td><td>2026-03-10 10:00</td></tr>
          </table></body></html>"#;
        let phases = parse_help_schedule(html, now);
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[1].name, "补退选阶段");
        assert_eq!(phases[1].start_ts, ts(2026, 2, 27, 15, 0));
    }

    #[test]
    fn test_find_next_operation_start_filters_names() {
        let phases = vec![
            SchedulePhase {
                name: "第一轮预选".to_string(),
                start_ts: 200,
                end_ts: 300,
            },
            SchedulePhase {
                name: "补退选阶段".to_string(),
                start_ts: 500,
                end_ts: 900,
            },
            SchedulePhase {
                name: "候补阶段".to_string(),
                start_ts: 400,
                end_ts: 450,
            },
        ];
        let next = find_next_operation_start(100, &phases).unwrap();
        assert_eq!(next.name, "候补阶段");
        // Phases already started are skipped.
        let next = find_next_operation_start(420, &phases).unwrap();
        assert_eq!(next.name, "补退选阶段");
        assert!(find_next_operation_start(1000, &phases).is_none());
    }
}
