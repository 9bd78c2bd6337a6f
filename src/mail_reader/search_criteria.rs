use chrono::{Datelike, Days, NaiveDate};
use itertools::Itertools;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOperator {
    Since,
    Before,
}

impl DateOperator {
    pub fn keyword(&self) -> &'static str {
        match self {
            DateOperator::Since => "SINCE",
            DateOperator::Before => "BEFORE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    All,
    Date(DateOperator, String),
}

/// Ordered IMAP search terms: `ALL`, then `SINCE`, then `BEFORE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    terms: Vec<SearchTerm>,
}

impl SearchCriteria {
    pub fn terms(&self) -> &[SearchTerm] {
        &self.terms
    }

    /// Renders the criteria as the argument of a `UID SEARCH` command.
    pub fn to_imap_query(&self) -> String {
        self.terms()
            .iter()
            .map(|term| match term {
                SearchTerm::All => "ALL".to_string(),
                SearchTerm::Date(operator, date) => format!("{} {}", operator.keyword(), date),
            })
            .join(" ")
    }
}

// IMAP dates are D-Mon-YYYY, no leading zero on the day
pub fn format_imap_date(date: NaiveDate) -> String {
    format!("{}-{}-{}", date.day(), MONTHS[date.month0() as usize], date.year())
}

/// Builds the search terms for a received-date range.
///
/// Both bounds are inclusive. IMAP `BEFORE` excludes its own day, so the upper
/// bound is shifted forward by one day before it is formatted.
pub fn build_criteria(after: Option<NaiveDate>, before: Option<NaiveDate>) -> SearchCriteria {
    let mut terms = vec![SearchTerm::All];

    if let Some(after) = after {
        terms.push(SearchTerm::Date(DateOperator::Since, format_imap_date(after)));
    }

    if let Some(before) = before {
        let exclusive = before.checked_add_days(Days::new(1)).unwrap_or(before);
        terms.push(SearchTerm::Date(DateOperator::Before, format_imap_date(exclusive)));
    }

    SearchCriteria { terms }
}
