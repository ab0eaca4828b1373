#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub order: SortOrder,
}

impl SortKey {
    #[must_use]
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    #[must_use]
    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Descending,
        }
    }
}

/// What a view is looking at: table identity plus the filter predicate and
/// sort keys produced by the query builder.
///
/// The paging core never interprets the filter text; it only compares
/// whole specifications to detect that the user changed what they are
/// looking at, which invalidates in-flight loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub database: Option<String>,
    pub table: String,
    pub filter: Option<String>,
    pub sort: Vec<SortKey>,
}

impl QuerySpec {
    #[must_use]
    pub fn for_table(database: Option<String>, table: impl Into<String>) -> Self {
        Self {
            database,
            table: table.into(),
            filter: None,
            sort: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.and_then(|raw| {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{QuerySpec, SortKey};

    #[test]
    fn specs_compare_by_full_signature() {
        let base = QuerySpec::for_table(Some("app".to_string()), "users");
        assert_eq!(base, base.clone());

        let filtered = base.clone().with_filter(Some("id > 10".to_string()));
        assert_ne!(base, filtered);

        let sorted = base.clone().with_sort(vec![SortKey::ascending("email")]);
        assert_ne!(base, sorted);
        assert_ne!(filtered, sorted);

        let other_table = QuerySpec::for_table(Some("app".to_string()), "sessions");
        assert_ne!(base, other_table);
    }

    #[test]
    fn blank_filters_normalize_to_none() {
        let spec = QuerySpec::for_table(None, "users").with_filter(Some("   ".to_string()));
        assert_eq!(spec.filter, None);

        let spec = spec.with_filter(Some("  id = 1 ".to_string()));
        assert_eq!(spec.filter.as_deref(), Some("id = 1"));
    }
}
