//! Comick API payload shapes and strict validation.
//!
//! The wire types deserialize every field as optional so a malformed
//! payload survives parsing and fails validation with a diagnostic
//! instead of a bare serde error. Downstream code only ever sees the
//! validated shapes.

use serde::Deserialize;

/// Raw search item as returned by `/v1.0/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchItem {
    pub hid: Option<String>,
    pub slug: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub md_titles: Option<Vec<MdTitle>>,
    #[serde(default)]
    pub md_covers: Option<Vec<MdCover>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdTitle {
    pub title: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdCover {
    pub b2key: Option<String>,
}

/// Raw detail payload as returned by `/comic/<slug>`.
#[derive(Debug, Clone, Deserialize)]
pub struct DetailPayload {
    pub comic: Option<ComicNode>,
    #[serde(default)]
    pub authors: Option<Vec<Person>>,
    #[serde(default)]
    pub artists: Option<Vec<Person>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComicNode {
    pub hid: Option<String>,
    pub slug: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub md_titles: Option<Vec<MdTitle>>,
    #[serde(default)]
    pub md_covers: Option<Vec<MdCover>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Person {
    pub name: Option<String>,
}

/// Validated alternate title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltTitle {
    pub title: String,
    pub lang: Option<String>,
}

/// Validated search candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub hid: String,
    pub slug: String,
    pub title: String,
    pub alt_titles: Vec<AltTitle>,
    pub cover_keys: Vec<String>,
}

/// Validated comic detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComicDetail {
    pub hid: String,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<i64>,
    pub alt_titles: Vec<AltTitle>,
    pub cover_keys: Vec<String>,
    pub authors: Vec<String>,
    pub artists: Vec<String>,
}

fn require(field: &Option<String>, what: &str) -> Result<String, String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(format!("Malformed payload: {what} missing or empty")),
    }
}

fn validate_titles(raw: &Option<Vec<MdTitle>>, context: &str) -> Result<Vec<AltTitle>, String> {
    let Some(raw) = raw else {
        return Err(format!("Malformed payload: {context}.md_titles is null"));
    };
    raw.iter()
        .map(|t| {
            Ok(AltTitle {
                title: require(&t.title, &format!("{context}.md_titles[].title"))?,
                lang: t.lang.clone(),
            })
        })
        .collect()
}

fn validate_covers(raw: &Option<Vec<MdCover>>, context: &str) -> Result<Vec<String>, String> {
    let Some(raw) = raw else {
        return Err(format!("Malformed payload: {context}.md_covers is null"));
    };
    raw.iter()
        .map(|c| require(&c.b2key, &format!("{context}.md_covers[].b2key")))
        .collect()
}

fn validate_people(raw: &Option<Vec<Person>>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.name.clone())
        .filter(|name| !name.trim().is_empty())
        .collect()
}

/// Validate one search item.
pub fn validate_search_item(item: &SearchItem) -> Result<Candidate, String> {
    Ok(Candidate {
        hid: require(&item.hid, "search.hid")?,
        slug: require(&item.slug, "search.slug")?,
        title: require(&item.title, "search.title")?,
        alt_titles: validate_titles(&item.md_titles, "search")?,
        cover_keys: validate_covers(&item.md_covers, "search")?,
    })
}

/// Validate a search response. One malformed item fails the payload.
pub fn validate_search(items: &[SearchItem]) -> Result<Vec<Candidate>, String> {
    items.iter().map(validate_search_item).collect()
}

/// Validate a detail payload.
pub fn validate_detail(payload: &DetailPayload) -> Result<ComicDetail, String> {
    let Some(comic) = &payload.comic else {
        return Err("Malformed payload: comic is null".to_string());
    };
    Ok(ComicDetail {
        hid: require(&comic.hid, "comic.hid")?,
        slug: require(&comic.slug, "comic.slug")?,
        title: require(&comic.title, "comic.title")?,
        description: comic.desc.clone().filter(|d| !d.trim().is_empty()),
        status: comic.status,
        alt_titles: validate_titles(&comic.md_titles, "comic")?,
        cover_keys: validate_covers(&comic.md_covers, "comic")?,
        authors: validate_people(&payload.authors),
        artists: validate_people(&payload.artists),
    })
}
