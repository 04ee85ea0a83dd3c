//! Dual-source event extraction: JSON API payloads captured during page
//! navigation, and a DOM fallback parsed out of the rendered HTML.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::error::CoreError;
use crate::model::{first_present, Details, Event, EventSource, Section};

const TOKEN_KEYS: [&str; 6] = ["token", "coin", "project", "name", "symbol", "ticker"];
const TIME_KEYS: [&str; 6] = [
    "time",
    "start_time",
    "startTime",
    "listing_time",
    "airdrop_time",
    "airdropTime",
];

const TODAY_KEYWORDS: [&str; 6] = [
    "today",
    "today's airdrops",
    "today list",
    "今日",
    "今日上币",
    "今日空投",
];
const UPCOMING_KEYWORDS: [&str; 5] = [
    "upcoming",
    "upcoming list",
    "即将",
    "即将上币",
    "即将空投",
];

/// Substrings identifying navigational/help tiles rather than real events.
const TOOL_CARD_MARKERS: [&str; 8] = ["工具", "通知", "看板", "提示", "帮助", "目标", "模拟", "推特"];

/// A page capture handed to the extractor by whatever drives the browser.
///
/// Building the actual browser automation is out of scope here; `navigate`
/// is the seam tests substitute with canned payloads.
#[derive(Debug, Clone, Default)]
pub struct CapturedPage {
    pub json_payloads: Vec<Value>,
    pub html: String,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self) -> Result<CapturedPage, CoreError>;
}

/// Fetches a page capture with up to three attempts (1s, then 2s backoff),
/// merges the JSON and DOM views into a deduplicated list, drops tool
/// cards, and keeps only events whose final section is `today`.
///
/// `today` normalizes any explicit `details.date`/`details.Date` field and
/// decides whether the event belongs in the surviving "today" set.
pub async fn fetch_events(session: &dyn BrowserSession, today: NaiveDate) -> Result<Vec<Event>, CoreError> {
    let strategy = ExponentialBackoff::from_millis(1000)
        .max_delay(Duration::from_secs(8))
        .take(2);
    let page = Retry::spawn(strategy, || session.navigate()).await?;

    let mut events = parse_json_payloads(&page.json_payloads);
    events.extend(parse_html_document(&page.html));
    let merged = merge_events(events);
    let without_tools = drop_tool_cards(merged);
    let kept = enrich_and_keep_today(without_tools, today);
    tracing::info!(count = kept.len(), "extracted today's events");
    Ok(kept)
}

/// Applies the `details.date`-driven section override and drops anything
/// that doesn't end up in `today` once that override is applied.
fn enrich_and_keep_today(events: Vec<Event>, today: NaiveDate) -> Vec<Event> {
    let today_str = today.format("%Y-%m-%d").to_string();
    events
        .into_iter()
        .filter_map(|mut event| {
            let explicit_date = first_present(&event.details, &["date"])
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if let Some(date_str) = explicit_date {
                event.section = if date_str == today_str {
                    Section::Today
                } else {
                    Section::Upcoming
                };
            }
            (event.section == Section::Today).then_some(event)
        })
        .collect()
}

fn normalize_section(text: &str) -> Section {
    let lowered = text.to_lowercase();
    if TODAY_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Section::Today
    } else if UPCOMING_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Section::Upcoming
    } else {
        Section::Unknown
    }
}

fn is_tool_card(event: &Event) -> bool {
    if TOOL_CARD_MARKERS.iter().any(|marker| event.token.contains(marker)) {
        return true;
    }
    if event.details.contains_key("tool") || event.details.contains_key("工具") {
        return true;
    }
    if let Some(Value::Array(lines)) = event.details.get("lines") {
        return lines.iter().any(|line| {
            line.as_str()
                .map(|l| TOOL_CARD_MARKERS.iter().any(|marker| l.contains(marker)))
                .unwrap_or(false)
        });
    }
    false
}

fn drop_tool_cards(events: Vec<Event>) -> Vec<Event> {
    events.into_iter().filter(|e| !is_tool_card(e)).collect()
}

fn looks_like_time(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    if ["tba", "to be announced", "—", "-", "n/a", ""].contains(&lowered.as_str()) {
        return true;
    }
    crate::timeutil::parse_event_time(value, chrono_tz::UTC, crate::timeutil::now_in_tz(chrono_tz::UTC))
        .is_some()
        || has_clock_digits(value)
}

fn has_clock_digits(value: &str) -> bool {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b':'
            && i > 0
            && bytes[i - 1].is_ascii_digit()
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
        {
            return true;
        }
    }
    false
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Copies `map` with the token/time keys already consumed into dedicated
/// fields left out, case-insensitively, so they don't leak back into
/// `details` (and from there into the rendered notification body).
fn details_excluding(map: &serde_json::Map<String, Value>, consumed: &[&str]) -> Details {
    map.iter()
        .filter(|(k, _)| !consumed.iter().any(|key| k.eq_ignore_ascii_case(key)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Recursively finds every list-of-objects in a JSON value, labeling each
/// with the dotted key path it was found at (object keys joined by `.`,
/// array indices rendered as `[i]`).
fn iter_candidate_lists(value: &Value, path: &str, out: &mut Vec<(String, Vec<Value>)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let new_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                iter_candidate_lists(v, &new_path, out);
            }
        }
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_object) {
                out.push((path.to_string(), items.clone()));
            }
            for (i, item) in items.iter().enumerate() {
                iter_candidate_lists(item, &format!("{path}[{i}]"), out);
            }
        }
        _ => {}
    }
}

pub fn parse_json_payloads(payloads: &[Value]) -> Vec<Event> {
    let mut events = Vec::new();
    for payload in payloads {
        let mut candidates = Vec::new();
        iter_candidate_lists(payload, "", &mut candidates);
        for (path, items) in candidates {
            let section = normalize_section(&path);
            for item in items {
                let Some(map) = item.as_object() else {
                    continue;
                };
                let Some(token) = first_present(map, &TOKEN_KEYS).and_then(|v| v.as_str()) else {
                    continue;
                };
                let raw_time = first_present(map, &TIME_KEYS)
                    .and_then(value_to_string)
                    .unwrap_or_else(|| "TBA".to_string());
                let consumed: Vec<&str> = TOKEN_KEYS.iter().chain(TIME_KEYS.iter()).copied().collect();
                events.push(Event {
                    token: token.to_string(),
                    section,
                    raw_time,
                    start_time: None,
                    details: details_excluding(map, &consumed),
                    source: EventSource::Json,
                    url: None,
                });
            }
        }
    }
    events
}

fn find_next_element<'a>(html: &'a Html, after: ego_tree::NodeId, tag: &str) -> Option<ElementRef<'a>> {
    let mut found_after = false;
    for node in html.tree.root().descendants() {
        if found_after {
            if let Some(el) = ElementRef::wrap(node) {
                if el.value().name() == tag {
                    return Some(el);
                }
            }
        }
        if node.id() == after {
            found_after = true;
        }
    }
    None
}

fn element_lines(el: &ElementRef) -> Vec<String> {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-cases and collapses internal whitespace, so a header like `"Listing
/// Time"` (or one split across wrapped text nodes) becomes a stable key.
fn normalize_header(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn parse_table_section(
    table: &ElementRef,
    section: Section,
    events: &mut Vec<Event>,
    seen: &mut HashSet<(Section, String)>,
) {
    let row_sel = Selector::parse("tr").unwrap();
    let cell_sel = Selector::parse("th,td").unwrap();
    let mut rows = table.select(&row_sel);
    let Some(header_row) = rows.next() else {
        return;
    };
    let header_cells: Vec<String> = header_row
        .select(&cell_sel)
        .map(|c| normalize_header(&c.text().collect::<String>()))
        .collect();
    let token_idx = header_cells
        .iter()
        .position(|c| ["token", "coin", "项目", "name", "symbol"].iter().any(|k| c.contains(k)));
    let time_idx = header_cells
        .iter()
        .position(|c| ["time", "时间", "时刻", "开始"].iter().any(|k| c.contains(k)));

    for row in rows {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.is_empty() {
            continue;
        }
        let token = token_idx
            .and_then(|i| cells.get(i))
            .cloned()
            .unwrap_or_else(|| cells[0].clone());
        if token.is_empty() {
            continue;
        }
        let time_idx = time_idx.or_else(|| cells.iter().position(|c| looks_like_time(c)));
        let raw_time = time_idx
            .and_then(|i| cells.get(i))
            .cloned()
            .unwrap_or_else(|| "TBA".to_string());

        let key = (section, format!("{token}|{raw_time}"));
        if !seen.insert(key) {
            continue;
        }
        let mut details = Details::new();
        for (i, cell) in cells.iter().enumerate() {
            if Some(i) == token_idx || Some(i) == time_idx || cell.is_empty() {
                continue;
            }
            let header = header_cells
                .get(i)
                .filter(|h| !h.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("col_{i}"));
            details.insert(header, Value::String(cell.clone()));
        }
        events.push(Event {
            token,
            section,
            raw_time,
            start_time: None,
            details,
            source: EventSource::Dom,
            url: None,
        });
    }
}

fn parse_card_section(
    container: &ElementRef,
    section: Section,
    events: &mut Vec<Event>,
    seen: &mut HashSet<(Section, String)>,
) {
    let div_sel = Selector::parse("div").unwrap();
    let cards: Vec<ElementRef> = container.select(&div_sel).collect();
    let cards = if cards.is_empty() {
        vec![*container]
    } else {
        cards
    };

    for card in cards {
        let lines = element_lines(&card);
        let Some(token) = lines.first().cloned() else {
            continue;
        };
        if token.is_empty() {
            continue;
        }
        let raw_time = lines[1..]
            .iter()
            .find(|l| looks_like_time(l))
            .cloned()
            .unwrap_or_else(|| "TBA".to_string());
        let key = (section, format!("{token}|{raw_time}"));
        if !seen.insert(key) {
            continue;
        }
        let detail_lines: Vec<Value> = lines[1..]
            .iter()
            .filter(|l| *l != &raw_time)
            .cloned()
            .map(Value::String)
            .collect();
        let mut details = Details::new();
        details.insert("lines".to_string(), Value::Array(detail_lines));
        events.push(Event {
            token,
            section,
            raw_time,
            start_time: None,
            details,
            source: EventSource::Dom,
            url: None,
        });
    }
}

/// Parses the rendered HTML document, walking each `h1`-`h4` heading and
/// treating the next table or div block found anywhere after it in document
/// order as that heading's section content.
pub fn parse_html_document(html: &str) -> Vec<Event> {
    let document = Html::parse_document(html);
    let heading_sel = Selector::parse("h1,h2,h3,h4").unwrap();
    let mut events = Vec::new();
    let mut seen: HashSet<(Section, String)> = HashSet::new();

    let headings: Vec<ElementRef> = document.select(&heading_sel).collect();
    for heading in headings {
        let text: String = heading.text().collect();
        let section = normalize_section(&text);
        if let Some(table) = find_next_element(&document, heading.id(), "table") {
            parse_table_section(&table, section, &mut events, &mut seen);
        } else if let Some(div) = find_next_element(&document, heading.id(), "div") {
            parse_card_section(&div, section, &mut events, &mut seen);
        }
    }
    events
}

/// Merges JSON- and DOM-sourced events on `(section, token, raw_time)`
/// identity, letting a DOM-sourced record win any collision regardless of
/// which list it appeared in first.
pub fn merge_events(events: Vec<Event>) -> Vec<Event> {
    let mut order: Vec<(Section, String, String)> = Vec::new();
    let mut map: HashMap<(Section, String, String), Event> = HashMap::new();

    for event in events {
        let key = event.identity_key();
        match map.get(&key) {
            None => {
                order.push(key.clone());
                map.insert(key, event);
            }
            Some(existing) => {
                if event.source == EventSource::Dom || existing.source != EventSource::Dom {
                    map.insert(key, event);
                }
            }
        }
    }

    order.into_iter().filter_map(|k| map.remove(&k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_json_payloads_extracts_events() {
        let payload = json!({
            "today": [
                {"token": "ALPHA", "time": "14:00"},
                {"token": "BETA"},
            ]
        });
        let events = parse_json_payloads(&[payload]);
        let tokens: Vec<&str> = events.iter().map(|e| e.token.as_str()).collect();
        assert!(tokens.contains(&"ALPHA"));
        assert!(tokens.contains(&"BETA"));
        assert!(events.iter().any(|e| e.raw_time == "TBA"));
    }

    #[test]
    fn parse_json_payloads_excludes_consumed_keys_from_details() {
        let payload = json!({
            "today": [
                {"token": "ALPHA", "time": "14:00", "amount": "5000"},
            ]
        });
        let events = parse_json_payloads(&[payload]);
        let alpha = &events[0];
        assert!(!alpha.details.contains_key("token"));
        assert!(!alpha.details.contains_key("time"));
        assert_eq!(alpha.details.get("amount").unwrap(), "5000");
    }

    #[test]
    fn parse_html_document_maps_sections_and_tba() {
        let html = r#"
            <html><body>
                <h2>Today</h2>
                <table>
                    <tr><th>Token</th><th>Time</th></tr>
                    <tr><td>DELTA</td><td>18:30</td></tr>
                </table>
                <h2>Upcoming</h2>
                <div>
                    <div>GAMMA<br/>TBA</div>
                </div>
            </body></html>
        "#;
        let events = parse_html_document(html);
        assert_eq!(events.len(), 2);
        let today = events.iter().find(|e| e.section == Section::Today).unwrap();
        assert_eq!(today.token, "DELTA");
        let upcoming = events.iter().find(|e| e.section == Section::Upcoming).unwrap();
        assert_eq!(upcoming.raw_time.to_lowercase(), "tba");
    }

    #[test]
    fn parse_table_section_maps_non_key_columns_into_details() {
        let html = r#"
            <html><body>
                <h2>Today</h2>
                <table>
                    <tr><th>Token</th><th>Time</th><th>Amount</th></tr>
                    <tr><td>ALPHA</td><td>12:00</td><td>5000</td></tr>
                </table>
            </body></html>
        "#;
        let events = parse_html_document(html);
        let alpha = events.iter().find(|e| e.token == "ALPHA").unwrap();
        assert_eq!(alpha.details.get("amount").unwrap(), "5000");
        assert!(!alpha.details.contains_key("token"));
        assert!(!alpha.details.contains_key("time"));
    }

    #[test]
    fn merge_events_prefers_dom_on_collision() {
        let json_event = Event {
            token: "ALPHA".to_string(),
            section: Section::Today,
            raw_time: "14:00".to_string(),
            start_time: None,
            details: Details::new(),
            source: EventSource::Json,
            url: None,
        };
        let mut dom_event = json_event.clone();
        dom_event.source = EventSource::Dom;
        dom_event.details.insert("extra".to_string(), json!("dom-only"));

        let merged = merge_events(vec![json_event, dom_event]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, EventSource::Dom);
        assert!(merged[0].details.contains_key("extra"));
    }

    #[test]
    fn drop_tool_cards_filters_navigational_tiles() {
        let events = vec![Event {
            token: "空投工具箱".to_string(),
            section: Section::Unknown,
            raw_time: "TBA".to_string(),
            start_time: None,
            details: Details::new(),
            source: EventSource::Dom,
            url: None,
        }];
        assert!(drop_tool_cards(events).is_empty());
    }

    #[test]
    fn drop_tool_cards_filters_by_tool_detail_key() {
        let mut details = Details::new();
        details.insert("tool".to_string(), json!(true));
        let events = vec![Event {
            token: "ALPHA".to_string(),
            section: Section::Today,
            raw_time: "14:00".to_string(),
            start_time: None,
            details,
            source: EventSource::Dom,
            url: None,
        }];
        assert!(drop_tool_cards(events).is_empty());
    }

    #[test]
    fn enrich_and_keep_today_forces_section_from_date_field() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 26).unwrap();
        let mut matching_details = Details::new();
        matching_details.insert("date".to_string(), json!("2024-05-26"));
        let mut stale_details = Details::new();
        stale_details.insert("date".to_string(), json!("2024-05-25"));

        let events = vec![
            Event {
                token: "MATCH".to_string(),
                section: Section::Unknown,
                raw_time: "14:00".to_string(),
                start_time: None,
                details: matching_details,
                source: EventSource::Dom,
                url: None,
            },
            Event {
                token: "STALE".to_string(),
                section: Section::Today,
                raw_time: "14:00".to_string(),
                start_time: None,
                details: stale_details,
                source: EventSource::Dom,
                url: None,
            },
        ];

        let kept = enrich_and_keep_today(events, today);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].token, "MATCH");
    }
}
