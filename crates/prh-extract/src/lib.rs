//! HTML extraction for club results pages and parkrunner profile pages.

use prh_core::ParticipantId;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "prh-extract";

/// Path segment identifying a profile link.
pub const PROFILE_LINK_MARKER: &str = "parkrunner";

/// Heading text the site uses when a profile has no public name.
pub const GENERIC_PROFILE_HEADING: &str = "parkrunner";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Participant ids of every row mentioning `club_name`, in document order.
///
/// Duplicates are kept; callers aggregate into a set. A blank club name
/// matches nothing.
pub fn extract_participant_ids(
    html: &str,
    club_name: &str,
) -> Result<Vec<ParticipantId>, ExtractError> {
    if club_name.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;

    let mut ids = Vec::new();
    for row in document.select(&row_sel) {
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if !cells.iter().any(|cell| element_text(*cell).contains(club_name)) {
            continue;
        }
        for cell in cells {
            let Some(href) = cell
                .select(&link_sel)
                .next()
                .and_then(|link| link.value().attr("href"))
            else {
                continue;
            };
            if !href.contains(PROFILE_LINK_MARKER) {
                continue;
            }
            if let Some(id) = participant_id_from_href(href) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Last path segment of a profile link, without query string or fragment.
/// A link ending at the marker segment itself carries no id.
pub fn participant_id_from_href(href: &str) -> Option<ParticipantId> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| text_or_none(segment.to_string()))
        .filter(|segment| segment != PROFILE_LINK_MARKER)
        .map(ParticipantId::from)
}

/// Display name from a profile page, normalised to title case.
pub fn parse_profile_name(html: &str) -> Result<Option<String>, ExtractError> {
    let document = Html::parse_document(html);

    let heading = document
        .select(&selector("h2")?)
        .next()
        .and_then(|h| text_or_none(element_text(h)))
        .filter(|name| !is_generic_heading(name));

    let raw = match heading {
        Some(name) => Some(name),
        None => document
            .select(&selector("title")?)
            .next()
            .map(element_text)
            .and_then(|title| name_from_title(&title)),
    };

    Ok(raw.and_then(|name| normalize_display_name(&name)))
}

fn is_generic_heading(text: &str) -> bool {
    text.eq_ignore_ascii_case(GENERIC_PROFILE_HEADING)
}

/// Text after the last `|` of a title such as `parkrunner results | Jane SMITH`.
fn name_from_title(title: &str) -> Option<String> {
    let (_, name) = title.rsplit_once('|')?;
    text_or_none(name.to_string())
}

/// Drops a trailing `(id)` suffix and title-cases the rest.
pub fn normalize_display_name(raw: &str) -> Option<String> {
    let without_id = match raw.rsplit_once('(') {
        Some((name, _)) => name,
        None => raw,
    };
    let name = text_or_none(title_case(without_id))?;
    if is_generic_heading(&name) {
        return None;
    }
    Some(name)
}

/// Upper-cases the first letter of each alphabetic run and lower-cases the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}
