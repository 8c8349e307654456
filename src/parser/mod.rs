//! Listing-page HTML parsing
//!
//! The elective site renders everything as nested `datagrid` tables. This
//! parser is deliberately tolerant: it locates columns by header text (so
//! header reordering and whitespace changes survive), and recovers a course
//! name from the `confirmSelect(...)` onclick handler when the visible cell
//! is empty (some rows render the name via JS).
//!
//! All functions here are synchronous over `&str`; parsed DOM values never
//! escape, so callers can use them freely between awaits.

pub mod schedule;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::course::Course;
use crate::error::ElectiveError;

static SEL_DATAGRID: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table table.datagrid").expect("static selector"));
static SEL_HEADER_TH: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr.datagrid-header th").expect("static selector"));
static SEL_ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr.datagrid-odd, tr.datagrid-even").expect("static selector"));
static SEL_ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").expect("static selector"));
static SEL_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("head title").expect("static selector"));
static SEL_MSG_TIPS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("td#msgTips").expect("static selector"));
static SEL_TABLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table").expect("static selector"));
static SEL_TD: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("static selector"));

static RE_SIDA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\?sida=(\S+?)&sttp=(?:bzx|bfx)").expect("static regex"));
static RE_CONFIRM_SELECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"confirmSelect\('(?P<xh>[^']*)','(?P<teacher>[^']*)','(?P<name>[^']*)','(?P<class_no>[^']*)'")
        .expect("static regex")
});
static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Concatenated, whitespace-collapsed text of a cell.
fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("")
}

/// Direct `th`/`td` children of a row, in order. Descendant selection would
/// leak cells of nested tables, so this walks children explicitly.
fn row_cells<'a>(row: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| {
            let name = el.value().name();
            name == "th" || name == "td"
        })
        .collect()
}

/// Locate a column by header text: exact match after trimming first, then
/// substring match to survive annotations like `课程名(新)`.
fn find_column(header: &[String], key: &str) -> Option<usize> {
    header
        .iter()
        .position(|h| h == key)
        .or_else(|| header.iter().position(|h| h.contains(key)))
}

fn table_header(table: ElementRef<'_>) -> Vec<String> {
    table.select(&SEL_HEADER_TH).map(|th| cell_text(th)).collect()
}

/// `"10 / 7"`, `"10/7"` and friends -> `(10, 7)`.
fn parse_quota_pair(text: &str) -> Option<(u32, u32)> {
    let mut nums = RE_DIGITS
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<u32>().ok());
    let max = nums.next()?;
    let used = nums.next()?;
    Some((max, used))
}

/// Courses with identity only (the "elected" table).
fn courses_from_table(table: ElementRef<'_>) -> Result<Vec<Course>, ElectiveError> {
    let header = table_header(table);
    let ix_name = find_column(&header, "课程名");
    let ix_class = find_column(&header, "班号");
    let ix_school = find_column(&header, "开课单位");
    let (Some(ix_name), Some(ix_class), Some(ix_school)) = (ix_name, ix_class, ix_school) else {
        return Err(ElectiveError::UnexpectedHtmlFormat {
            message: format!("missing identity columns in header {header:?}"),
        });
    };

    let mut courses = Vec::new();
    for row in table.select(&SEL_ROWS) {
        let cells = row_cells(row);
        let Some(name_cell) = cells.get(ix_name) else { continue };
        let Some(class_cell) = cells.get(ix_class) else { continue };
        let Some(school_cell) = cells.get(ix_school) else { continue };
        let name = cell_text(*name_cell);
        let class_no = cell_text(*class_cell);
        let school = cell_text(*school_cell);
        if name.is_empty() || class_no.is_empty() || school.is_empty() {
            continue;
        }
        courses.push(Course::new(name, class_no, school));
    }
    Ok(courses)
}

/// Courses with quota and action href (the "plans" table).
fn courses_with_detail_from_table(table: ElementRef<'_>) -> Result<Vec<Course>, ElectiveError> {
    let header = table_header(table);
    let ix_name = find_column(&header, "课程名");
    let ix_class = find_column(&header, "班号");
    let ix_school = find_column(&header, "开课单位");
    let ix_quota = find_column(&header, "限数/已选");
    let ix_action = find_column(&header, "补选");
    let (Some(ix_name), Some(ix_class), Some(ix_school), Some(ix_quota), Some(ix_action)) =
        (ix_name, ix_class, ix_school, ix_quota, ix_action)
    else {
        return Err(ElectiveError::UnexpectedHtmlFormat {
            message: format!("missing plan columns in header {header:?}"),
        });
    };

    let mut courses = Vec::new();
    for row in table.select(&SEL_ROWS) {
        let cells = row_cells(row);
        let (Some(name_cell), Some(class_cell), Some(school_cell), Some(quota_cell), Some(action_cell)) = (
            cells.get(ix_name),
            cells.get(ix_class),
            cells.get(ix_school),
            cells.get(ix_quota),
            cells.get(ix_action),
        ) else {
            continue;
        };

        let Some(quota) = parse_quota_pair(&cell_text(*quota_cell)) else {
            continue;
        };

        let anchor = action_cell.select(&SEL_ANCHOR).next();
        let href = anchor.and_then(|a| a.value().attr("href")).unwrap_or("");
        if href.is_empty() {
            continue;
        }

        let mut name = cell_text(*name_cell);
        if name.is_empty() {
            let onclick = anchor.and_then(|a| a.value().attr("onclick")).unwrap_or("");
            if let Some(caps) = RE_CONFIRM_SELECT.captures(onclick) {
                name = caps["name"].trim().to_string();
            }
        }
        let class_no = cell_text(*class_cell);
        let school = cell_text(*school_cell);
        if name.is_empty() || class_no.is_empty() || school.is_empty() {
            continue;
        }
        courses.push(Course::with_detail(name, class_no, school, quota, href));
    }
    Ok(courses)
}

/// Parse a listing page into `(elected, plans)`.
///
/// The page carries (at least) two datagrid tables: the election plan first,
/// the already-elected results second.
pub fn parse_listing(html: &str) -> Result<(Vec<Course>, Vec<Course>), ElectiveError> {
    let doc = Html::parse_document(html);
    let tables: Vec<ElementRef<'_>> = doc.select(&SEL_DATAGRID).collect();
    if tables.len() < 2 {
        return Err(ElectiveError::UnexpectedHtmlFormat {
            message: format!("missing datagrid tables, found {}", tables.len()),
        });
    }
    let plans = courses_with_detail_from_table(tables[0])?;
    let elected = courses_from_table(tables[1])?;
    Ok((elected, plans))
}

/// Parse only the elected table. Used on an `electSupplement` success body
/// to refresh the dynamic elected set inside a burst.
pub fn parse_elected(html: &str) -> Result<Vec<Course>, ElectiveError> {
    let doc = Html::parse_document(html);
    let tables: Vec<ElementRef<'_>> = doc.select(&SEL_DATAGRID).collect();
    if tables.len() < 2 {
        return Err(ElectiveError::UnexpectedHtmlFormat {
            message: format!("missing datagrid tables, found {}", tables.len()),
        });
    }
    courses_from_table(tables[1])
}

/// `<head><title>` text, if any. Dual-degree intermediate pages have none.
#[must_use]
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let title = doc.select(&SEL_TITLE).next()?;
    let text = cell_text(title);
    if text.is_empty() { None } else { Some(text) }
}

/// Text of the `msgTips` cell, if present. This is where election results
/// and most business errors surface.
#[must_use]
pub fn page_tips(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let tips = doc.select(&SEL_MSG_TIPS).next()?;
    // The message lives in the second cell of the doubly nested table under
    // the tips cell. Ancestors are checked relative to the tips cell, not
    // the whole document, since the cell itself sits inside page tables.
    let inner_table = tips
        .select(&SEL_TABLE)
        .find(|t| has_table_ancestor_below(*t, tips));
    let tds: Vec<ElementRef<'_>> = match inner_table {
        Some(t) => t.select(&SEL_TD).collect(),
        None => tips.select(&SEL_TD).collect(),
    };
    let text = match tds.get(1).or_else(|| tds.first()) {
        Some(inner) => cell_text(*inner),
        None => cell_text(tips),
    };
    if text.is_empty() { None } else { Some(text) }
}

/// True when `el` has a `table` ancestor strictly below `root`.
fn has_table_ancestor_below(el: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    let mut node = el.parent();
    while let Some(n) = node {
        if n.id() == root.id() {
            return false;
        }
        if let Some(e) = ElementRef::wrap(n) {
            if e.value().name() == "table" {
                return true;
            }
        }
        node = n.parent();
    }
    false
}

/// Extract the dual-degree `sida` token from the SSO landing page.
#[must_use]
pub fn extract_sida(text: &str) -> Option<String> {
    RE_SIDA
        .captures(text)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_fixture(plan_rows: &str, elected_rows: &str) -> String {
        format!(
            r#"<html><head><title>补退选</title></head><body><table><tr><td>
            <table class="datagrid">
              <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th><th>限数/已选</th><th>补选</th></tr>
              {plan_rows}
            </table>
            <table class="datagrid">
              <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th></tr>
              {elected_rows}
            </table>
            </td></tr></table></body></html>"#
        )
    }

    #[test]
    fn test_parse_listing_basic() {
        let html = listing_fixture(
            r#"<tr class="datagrid-odd"><td>代数</td><td>1</td><td>数学学院</td><td>10 / 9</td><td><a href="/elect?x=1">补选</a></td></tr>"#,
            r#"<tr class="datagrid-even"><td>几何</td><td>2</td><td>数学学院</td></tr>"#,
        );
        let (elected, plans) = parse_listing(&html).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "代数");
        assert_eq!(plans[0].quota, Some((10, 9)));
        assert_eq!(plans[0].href.as_deref(), Some("/elect?x=1"));
        assert!(plans[0].is_available());
        assert_eq!(elected.len(), 1);
        assert_eq!(elected[0].name, "几何");
    }

    #[test]
    fn test_parse_listing_header_reordered() {
        let html = format!(
            r#"<html><body><table><tr><td>
            <table class="datagrid">
              <tr class="datagrid-header"><th>班号</th><th> 课程名 </th><th>限数/已选</th><th>开课单位</th><th>补选</th></tr>
              <tr class="datagrid-odd"><td>3</td><td>拓扑</td><td>30/29</td><td>数学学院</td><td><a href="/elect?y=2">补选</a></td></tr>
            </table>
            <table class="datagrid">
              <tr class="datagrid-header"><th>课程名</th><th>班号</th><th>开课单位</th></tr>
            </table>
            </td></tr></table></body></html>"#
        );
        let (_, plans) = parse_listing(&html).unwrap();
        assert_eq!(plans[0].name, "拓扑");
        assert_eq!(plans[0].class_no, "3");
        assert_eq!(plans[0].quota, Some((30, 29)));
    }

    #[test]
    fn test_confirm_select_name_recovery() {
        let html = listing_fixture(
            r#"<tr class="datagrid-odd"><td></td><td>1</td><td>外国语学院</td><td>20/19</td>
               <td><a href="/elect?z=3" onclick="confirmSelect('2200012345','Smith','Advanced Listening','1'">补选</a></td></tr>"#,
            "",
        );
        let (_, plans) = parse_listing(&html).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "Advanced Listening");
    }

    #[test]
    fn test_missing_datagrid_is_error() {
        let err = parse_listing("<html><body>升级维护中</body></html>").unwrap_err();
        assert!(matches!(err, ElectiveError::UnexpectedHtmlFormat { .. }));
    }

    #[test]
    fn test_parse_idempotent_on_same_input() {
        let html = listing_fixture(
            r#"<tr class="datagrid-odd"><td>代数</td><td>1</td><td>数学学院</td><td>10 / 9</td><td><a href="/elect?x=1">补选</a></td></tr>"#,
            "",
        );
        let a = parse_listing(&html).unwrap();
        let b = parse_listing(&html).unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn test_tips_and_title() {
        let html = r#"<html><head><title>系统提示</title></head><body>
            <td id="msgTips"><table><tr><td><table><tr><td>img</td><td> 补选课程成功 </td></tr></table></td></tr></table></td>
            </body></html>"#;
        assert_eq!(page_title(html).as_deref(), Some("系统提示"));
        assert_eq!(page_tips(html).as_deref(), Some("补选课程成功"));
    }

    #[test]
    fn test_extract_sida() {
        let text = "location.href = 'sso_login.jsp?sida=abcdef0123456789&sttp=bzx'";
        assert_eq!(extract_sida(text).as_deref(), Some("abcdef0123456789"));
        assert!(extract_sida("no token here").is_none());
    }

    #[test]
    fn test_quota_pair_tolerates_separators() {
        assert_eq!(parse_quota_pair("10 / 7"), Some((10, 7)));
        assert_eq!(parse_quota_pair("限10已7"), Some((10, 7)));
        assert_eq!(parse_quota_pair("10"), None);
    }
}
