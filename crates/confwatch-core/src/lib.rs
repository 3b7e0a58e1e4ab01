//! Core domain model for confwatch: tracked events, typed date fields, and the catalog.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "confwatch-core";

pub const UNKNOWN: &str = "unknown";
pub const CLOSED: &str = "Closed";

pub const YEAR_PLACEHOLDER: &str = "{YEAR}";
pub const SHORT_YEAR_PLACEHOLDER: &str = "{YR}";

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";
const HUMAN_DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%Y/%m/%d", "%d %B %Y"];

/// Value of a date-typed record field.
///
/// `Unparsed` only ever comes from hand-edited catalog input; oracle replies are
/// validated with [`DateValue::parse_strict`] and cannot produce it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DateValue {
    Date(NaiveDate),
    Unknown,
    Closed,
    Unparsed(String),
}

impl DateValue {
    pub fn unknown() -> Self {
        Self::Unknown
    }

    /// Lenient parse used for catalog input. Never fails.
    pub fn parse(input: &str) -> Self {
        if let Some(value) = Self::parse_strict(input) {
            return value;
        }
        let trimmed = input.trim();
        for format in HUMAN_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return Self::Date(date);
            }
        }
        Self::Unparsed(input.to_string())
    }

    /// ISO `YYYY-MM-DD` or one of the sentinels, nothing else.
    pub fn parse_strict(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN) {
            return Some(Self::Unknown);
        }
        if trimmed.eq_ignore_ascii_case(CLOSED) {
            return Some(Self::Closed);
        }
        NaiveDate::parse_from_str(trimmed, ISO_DATE_FORMAT)
            .ok()
            .map(Self::Date)
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(date) => Some(*date),
            _ => None,
        }
    }

    pub fn is_before(&self, today: NaiveDate) -> bool {
        self.as_date().is_some_and(|date| date < today)
    }
}

impl fmt::Display for DateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(date) => write!(f, "{}", date.format(ISO_DATE_FORMAT)),
            Self::Unknown => f.write_str(UNKNOWN),
            Self::Closed => f.write_str(CLOSED),
            Self::Unparsed(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for DateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// One tracked recurring event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    #[serde(default)]
    pub abbreviation: String,
    /// Display link; may carry year placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub search_urls: Vec<String>,
    #[serde(deserialize_with = "deserialize_year")]
    pub previous_year: i32,
    #[serde(default = "DateValue::unknown")]
    pub start_date: DateValue,
    #[serde(default = "DateValue::unknown")]
    pub end_date: DateValue,
    #[serde(default = "unknown_location")]
    pub location: String,
    #[serde(default = "DateValue::unknown")]
    pub submission_deadline: DateValue,
    /// Keys this crate does not interpret, kept so a store round trip is lossless.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn unknown_location() -> String {
    UNKNOWN.to_string()
}

impl EntityRecord {
    pub fn display_url(&self) -> &str {
        self.url
            .as_deref()
            .or_else(|| self.search_urls.first().map(String::as_str))
            .unwrap_or_default()
    }

    pub fn location_known(&self) -> bool {
        let trimmed = self.location.trim();
        !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(UNKNOWN)
    }
}

fn deserialize_year<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    struct YearVisitor;

    impl<'de> Visitor<'de> for YearVisitor {
        type Value = i32;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a year as a number or numeric string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i32, E> {
            i32::try_from(v).map_err(|_| E::custom(format!("year out of range: {v}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i32, E> {
            i32::try_from(v).map_err(|_| E::custom(format!("year out of range: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i32, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid year: {v:?}")))
        }
    }

    deserializer.deserialize_any(YearVisitor)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub name: String,
    pub entities: Vec<EntityRecord>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("entity in category {category:?} has an empty name")]
    EmptyName { category: String },
    #[error("abbreviation {0:?} is used by more than one entity")]
    DuplicateAbbreviation(String),
}

/// Category name -> ordered entities. Order is part of the data: JSON key order
/// is preserved on both read and write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Catalog {
    categories: Vec<Category>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_category(&mut self, name: impl Into<String>, entities: Vec<EntityRecord>) {
        self.categories.push(Category {
            name: name.into(),
            entities,
        });
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn entities(&self) -> impl Iterator<Item = (&str, &EntityRecord)> {
        self.categories
            .iter()
            .flat_map(|c| c.entities.iter().map(move |e| (c.name.as_str(), e)))
    }

    pub fn entity_count(&self) -> usize {
        self.categories.iter().map(|c| c.entities.len()).sum()
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for (category, entity) in self.entities() {
            if entity.name.trim().is_empty() {
                return Err(CatalogError::EmptyName {
                    category: category.to_string(),
                });
            }
            if !entity.abbreviation.is_empty() && !seen.insert(entity.abbreviation.as_str()) {
                return Err(CatalogError::DuplicateAbbreviation(
                    entity.abbreviation.clone(),
                ));
            }
        }
        Ok(())
    }
}

impl Serialize for Catalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.categories.len()))?;
        for category in &self.categories {
            map.serialize_entry(&category.name, &category.entities)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Catalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CatalogVisitor;

        impl<'de> Visitor<'de> for CatalogVisitor {
            type Value = Catalog;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of category name to entity list")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Catalog, A::Error> {
                let mut catalog = Catalog::new();
                while let Some((name, entities)) =
                    access.next_entry::<String, Vec<EntityRecord>>()?
                {
                    if catalog.categories.iter().any(|c| c.name == name) {
                        return Err(de::Error::custom(format!("duplicate category {name:?}")));
                    }
                    catalog.push_category(name, entities);
                }
                Ok(catalog)
            }
        }

        deserializer.deserialize_map(CatalogVisitor)
    }
}

/// Candidate years for an entity's next occurrence. Always one or two members,
/// sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlausibleYears(Vec<i32>);

impl PlausibleYears {
    pub fn derive(previous_year: i32, current_year: i32) -> Self {
        let mut years = vec![(previous_year + 1).max(current_year), current_year + 1];
        years.sort_unstable();
        years.dedup();
        Self(years)
    }

    pub fn for_today(previous_year: i32, today: NaiveDate) -> Self {
        Self::derive(previous_year, today.year())
    }

    pub fn years(&self) -> &[i32] {
        &self.0
    }

    pub fn contains(&self, year: i32) -> bool {
        self.0.contains(&year)
    }

    /// `"2026"` or `"2025 or 2026"`.
    pub fn describe(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

fn has_year_placeholder(template: &str) -> bool {
    template.contains(YEAR_PLACEHOLDER) || template.contains(SHORT_YEAR_PLACEHOLDER)
}

fn substitute_year(template: &str, year: i32) -> String {
    template
        .replace(YEAR_PLACEHOLDER, &year.to_string())
        .replace(SHORT_YEAR_PLACEHOLDER, &format!("{:02}", year.rem_euclid(100)))
}

/// One URL per plausible year when the template has a placeholder, otherwise the literal URL.
pub fn expand_url(template: &str, years: &PlausibleYears) -> Vec<String> {
    if !has_year_placeholder(template) {
        return vec![template.to_string()];
    }
    years
        .years()
        .iter()
        .map(|year| substitute_year(template, *year))
        .collect()
}

pub fn expand_urls(templates: &[String], years: &PlausibleYears) -> Vec<String> {
    templates
        .iter()
        .flat_map(|t| expand_url(t, years))
        .collect()
}

/// Fill display-link placeholders from the start date, or next year when the start is not known.
pub fn replace_url_years(url: &str, start_date: &DateValue, today: NaiveDate) -> String {
    let year = start_date
        .as_date()
        .map(|d| d.year())
        .unwrap_or(today.year() + 1);
    substitute_year(url, year)
}
